//! Tracking state reconciler
//!
//! The Reconciler is responsible for:
//! - Owning the in-memory record set of tracked shipments
//! - Deciding whether a record needs a new lookup or a poll
//! - Merging API responses into records
//! - Writing the record set through to the StateStore after every mutation
//!
//! ## Architecture
//!
//! ```text
//!   track / remove / refresh_one / refresh_all / prune
//!                          │
//!                          ▼
//!                  ┌──────────────┐
//!                  │  Reconciler  │
//!                  └──────────────┘
//!                          │
//!         ┌────────────────┼────────────────┐
//!         │                │                │
//!         ▼                ▼                ▼
//! ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//! │ TrackingApi  │ │  StateStore  │ │    Events    │
//! │ (lookup)     │ │ (write-thru) │ │  (notify)    │
//! └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! ## Refresh Flow
//!
//! 1. Skip unknown and terminal records
//! 2. Token missing, unstamped or older than the TTL → start a new lookup
//! 3. Otherwise poll by token
//! 4. Merge a resolved payload, clear the token
//! 5. Persist if anything changed
//!
//! ## Locking
//!
//! The record set sits behind one async mutex. It is never held across a
//! remote call; it is held across `StateStore::save` so snapshots land in
//! mutation order. At most one track/refresh runs per tracking id at a time.

use crate::config::ParcelsConfig;
use crate::config::TrackingConfig;
use crate::error::{Error, Result};
use crate::record::{RecordSet, ShipmentRecord, ShipmentStatus};
use crate::traits::{
    ApiStatusSnapshot, InitResult, PollResult, ShipmentPayload, StateStore, TrackingApi,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// Outcome of a single track or refresh operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new correlation token was issued; the lookup is pending
    TokenIssued,
    /// The shipment resolved and was merged
    Resolved(ShipmentStatus),
    /// Polled a fresh token; the service is still working
    StillPending,
    /// The remote call failed; the record was left untouched
    Failed(String),
    /// Nothing to do (unknown id, terminal status, or record removed mid-flight)
    Skipped,
    /// Another operation for the same tracking id is in flight
    Busy,
}

/// Aggregate result of [`Reconciler::refresh_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Records visited
    pub attempted: usize,
    pub token_issued: usize,
    pub resolved: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped: usize,
    pub busy: usize,
}

impl RefreshSummary {
    fn record(&mut self, outcome: &RefreshOutcome) {
        self.attempted += 1;
        match outcome {
            RefreshOutcome::TokenIssued => self.token_issued += 1,
            RefreshOutcome::Resolved(_) => self.resolved += 1,
            RefreshOutcome::StillPending => self.pending += 1,
            RefreshOutcome::Failed(_) => self.failed += 1,
            RefreshOutcome::Skipped => self.skipped += 1,
            RefreshOutcome::Busy => self.busy += 1,
        }
    }
}

/// Events emitted by the Reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerEvent {
    /// A track request finished (whatever its outcome)
    Tracked {
        tracking_id: String,
        outcome: RefreshOutcome,
    },

    /// A record was removed
    Removed { tracking_id: String },

    /// Stale terminal records were pruned
    Pruned { tracking_ids: Vec<String> },

    /// Observers should re-read the record set
    RefreshRequested,

    /// Saving the record set failed; in-memory state is kept
    PersistFailed { error: String },
}

/// Tracking state reconciler
///
/// ## Lifecycle
///
/// 1. Create with [`Reconciler::new()`] (loads the record set from the store)
/// 2. Drive with [`PollScheduler`](crate::PollScheduler) and host calls
/// 3. Call [`Reconciler::flush()`] before dropping if a save failed
///
/// None of the operations return remote failures to the caller: they are
/// logged, reported in the outcome, and the remaining work continues.
pub struct Reconciler {
    /// Remote tracking service
    api: Box<dyn TrackingApi>,

    /// Durable copy of the record set
    store: Box<dyn StateStore>,

    /// Account this reconciler tracks for
    account: TrackingConfig,

    /// The record set (shared resource for all operations)
    records: Mutex<RecordSet>,

    /// Tracking ids with a track/refresh in flight
    in_flight: std::sync::Mutex<HashSet<String>>,

    /// Set when the last save failed
    dirty: AtomicBool,

    /// Event sender for observers
    event_tx: mpsc::Sender<ReconcilerEvent>,
}

/// Releases a tracking id's in-flight claim on drop
struct InFlightGuard<'a> {
    in_flight: &'a std::sync::Mutex<HashSet<String>>,
    tracking_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.tracking_id);
    }
}

impl Reconciler {
    /// Create a reconciler and load the record set
    ///
    /// # Returns
    ///
    /// A tuple of (reconciler, event_receiver) where event_receiver yields reconciler events
    pub async fn new(
        api: Box<dyn TrackingApi>,
        store: Box<dyn StateStore>,
        config: &ParcelsConfig,
    ) -> Result<(Self, mpsc::Receiver<ReconcilerEvent>)> {
        config.validate()?;

        let records = store.load().await?;
        info!(
            "Loaded {} tracked shipment(s) (api: {})",
            records.len(),
            api.api_name()
        );

        let (tx, rx) = mpsc::channel(config.scheduler.event_channel_capacity);

        let reconciler = Self {
            api,
            store,
            account: config.tracking.clone(),
            records: Mutex::new(records),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            dirty: AtomicBool::new(false),
            event_tx: tx,
        };

        Ok((reconciler, rx))
    }

    /// Start (or restart) tracking a shipment
    ///
    /// Creates a pending record for an unseen id, applies `display_name` if
    /// given, and starts a lookup. The record set is persisted afterwards
    /// even if the lookup failed.
    pub async fn track(&self, tracking_id: &str, display_name: Option<&str>) -> RefreshOutcome {
        let tracking_id = tracking_id.trim();
        if tracking_id.is_empty() {
            warn!("Ignoring track request with an empty tracking id");
            return RefreshOutcome::Skipped;
        }

        let Some(_guard) = self.claim(tracking_id) else {
            warn!(
                "Shipment {} already has an operation in flight, ignoring track request",
                tracking_id
            );
            if let Some(name) = display_name {
                self.rename(tracking_id, name).await;
            }
            return RefreshOutcome::Busy;
        };

        {
            let mut records = self.records.lock().await;
            let record = records.entry(tracking_id.to_string()).or_insert_with(|| {
                info!("Tracking new shipment {}", tracking_id);
                ShipmentRecord::new(tracking_id)
            });
            if let Some(name) = display_name {
                record.display_name = Some(name.to_string());
            }
        }

        let (outcome, _) = self.initiate(tracking_id).await;

        self.persist().await;
        self.emit_event(ReconcilerEvent::Tracked {
            tracking_id: tracking_id.to_string(),
            outcome: outcome.clone(),
        });

        outcome
    }

    /// Apply a display name to an existing record without a lookup
    async fn rename(&self, tracking_id: &str, name: &str) {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(tracking_id) else {
            return;
        };
        if record.display_name.as_deref() == Some(name) {
            return;
        }
        record.display_name = Some(name.to_string());
        self.save_locked(&records).await;
    }

    /// Stop tracking a shipment
    ///
    /// # Returns
    ///
    /// `true` if a record was removed, `false` if the id was unknown
    pub async fn remove(&self, tracking_id: &str) -> bool {
        let mut records = self.records.lock().await;
        if records.remove(tracking_id).is_none() {
            warn!("{}", Error::not_found(format!("shipment {}", tracking_id)));
            return false;
        }

        info!("Stopped tracking shipment {}", tracking_id);
        self.save_locked(&records).await;
        drop(records);

        self.emit_event(ReconcilerEvent::Removed {
            tracking_id: tracking_id.to_string(),
        });
        true
    }

    /// Refresh one shipment
    ///
    /// Polls a fresh token, or starts a new lookup when the token is
    /// missing, unstamped or expired.
    pub async fn refresh_one(&self, tracking_id: &str) -> RefreshOutcome {
        let Some(_guard) = self.claim(tracking_id) else {
            debug!("Shipment {} already has an operation in flight", tracking_id);
            return RefreshOutcome::Busy;
        };

        let fresh_token = {
            let records = self.records.lock().await;
            let Some(record) = records.get(tracking_id) else {
                warn!("{}", Error::not_found(format!("shipment {}", tracking_id)));
                return RefreshOutcome::Skipped;
            };
            if record.status.is_terminal() {
                debug!("Shipment {} is {}, not polling", tracking_id, record.status);
                return RefreshOutcome::Skipped;
            }
            record
                .fresh_token(Utc::now(), self.account.token_ttl())
                .map(str::to_owned)
        };

        let (outcome, mutated) = match fresh_token {
            None => {
                debug!(
                    "Token for {} missing or expired, starting a new lookup",
                    tracking_id
                );
                self.initiate(tracking_id).await
            }
            Some(token) => match self.api.poll(&self.account, &token).await {
                Ok(PollResult::Pending) => {
                    debug!("Tracking data not yet available for {}", tracking_id);
                    (RefreshOutcome::StillPending, false)
                }
                Ok(PollResult::Shipment(payload)) => self.resolve(tracking_id, &payload).await,
                Err(e) => {
                    warn!("Failed to poll shipment {}: {}", tracking_id, e);
                    (RefreshOutcome::Failed(e.to_string()), false)
                }
            },
        };

        if mutated {
            self.persist().await;
        }

        outcome
    }

    /// Refresh every non-terminal shipment, one at a time
    ///
    /// A failure on one record never stops the rest of the batch.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let tracking_ids: Vec<String> = {
            let records = self.records.lock().await;
            records
                .iter()
                .filter(|(_, record)| !record.status.is_terminal())
                .map(|(tracking_id, _)| tracking_id.clone())
                .collect()
        };

        let mut summary = RefreshSummary::default();
        for tracking_id in tracking_ids {
            let outcome = self.refresh_one(&tracking_id).await;
            summary.record(&outcome);
        }

        if summary.failed > 0 {
            warn!(
                "{} of {} shipment refreshes failed",
                summary.failed, summary.attempted
            );
        } else {
            debug!("Refreshed {} shipment(s)", summary.attempted);
        }

        summary
    }

    /// Manual full refresh: refresh everything, then signal observers
    pub async fn update_tracked_packages(&self) -> RefreshSummary {
        let summary = self.refresh_all().await;
        self.emit_event(ReconcilerEvent::RefreshRequested);
        summary
    }

    /// Remove delivered/archived records older than the retention window
    ///
    /// # Returns
    ///
    /// The removed tracking ids, sorted (empty when pruning is disabled)
    pub async fn prune(&self) -> Vec<String> {
        let Some(retention) = self.account.retention() else {
            debug!("Pruning disabled");
            return Vec::new();
        };

        let now = Utc::now();
        let mut records = self.records.lock().await;
        let pruned: Vec<String> = {
            let in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            records
                .iter()
                .filter(|(tracking_id, record)| {
                    record.is_prunable(now, retention) && !in_flight.contains(*tracking_id)
                })
                .map(|(tracking_id, _)| tracking_id.clone())
                .collect()
        };

        if pruned.is_empty() {
            return pruned;
        }

        for tracking_id in &pruned {
            records.remove(tracking_id);
        }
        info!("Pruned {} delivered/archived shipment(s)", pruned.len());
        self.save_locked(&records).await;
        drop(records);

        self.emit_event(ReconcilerEvent::Pruned {
            tracking_ids: pruned.clone(),
        });
        pruned
    }

    /// Probe the tracking service
    pub async fn probe(&self) -> ApiStatusSnapshot {
        self.api.probe().await
    }

    /// Point-in-time copy of the record set
    pub async fn snapshot(&self) -> RecordSet {
        self.records.lock().await.clone()
    }

    /// Copy of one record
    pub async fn get(&self, tracking_id: &str) -> Option<ShipmentRecord> {
        self.records.lock().await.get(tracking_id).cloned()
    }

    /// Account settings this reconciler was built with
    pub fn account(&self) -> &TrackingConfig {
        &self.account
    }

    /// Whether the last save failed and has not been retried successfully
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Retry a failed save
    ///
    /// No-op when the store is up to date.
    pub async fn flush(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let records = self.records.lock().await;
        self.store.save(&records).await?;
        self.dirty.store(false, Ordering::SeqCst);
        info!("Persisted {} shipment(s) after an earlier failure", records.len());
        Ok(())
    }

    /// Start a lookup and apply its result
    ///
    /// Returns the outcome and whether the record set changed.
    async fn initiate(&self, tracking_id: &str) -> (RefreshOutcome, bool) {
        match self.api.initiate_or_fetch(&self.account, tracking_id).await {
            Ok(InitResult::Token(token)) => {
                let applied = self
                    .with_record(tracking_id, |record, now| record.apply_token(token, now))
                    .await;
                if !applied {
                    return (RefreshOutcome::Skipped, false);
                }
                debug!("Lookup for {} pending", tracking_id);
                (RefreshOutcome::TokenIssued, true)
            }
            Ok(InitResult::Shipment(payload)) => self.resolve(tracking_id, &payload).await,
            Err(e) => {
                warn!("Failed to start lookup for {}: {}", tracking_id, e);
                (RefreshOutcome::Failed(e.to_string()), false)
            }
        }
    }

    /// Merge a resolved payload into its record
    async fn resolve(
        &self,
        tracking_id: &str,
        payload: &ShipmentPayload,
    ) -> (RefreshOutcome, bool) {
        let mut status = ShipmentStatus::Unknown;
        let applied = self
            .with_record(tracking_id, |record, now| {
                record.merge_payload(payload, now);
                status = record.status;
            })
            .await;
        if !applied {
            return (RefreshOutcome::Skipped, false);
        }

        info!("Shipment {} resolved: {}", tracking_id, status);
        (RefreshOutcome::Resolved(status), true)
    }

    /// Apply `f` to a record if it still exists
    async fn with_record<F>(&self, tracking_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ShipmentRecord, DateTime<Utc>),
    {
        let mut records = self.records.lock().await;
        match records.get_mut(tracking_id) {
            Some(record) => {
                f(record, Utc::now());
                true
            }
            None => {
                debug!(
                    "Shipment {} was removed while its lookup was in flight, discarding response",
                    tracking_id
                );
                false
            }
        }
    }

    /// Claim a tracking id for the duration of an operation
    fn claim(&self, tracking_id: &str) -> Option<InFlightGuard<'_>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_flight.insert(tracking_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            tracking_id: tracking_id.to_string(),
        })
    }

    /// Save the current record set
    async fn persist(&self) {
        let records = self.records.lock().await;
        self.save_locked(&records).await;
    }

    /// Save while the caller holds the record lock
    async fn save_locked(&self, records: &RecordSet) {
        match self.store.save(records).await {
            Ok(()) => self.dirty.store(false, Ordering::SeqCst),
            Err(e) => {
                error!(
                    "Failed to persist {} shipment(s): {}. Keeping in-memory state, will retry.",
                    records.len(),
                    e
                );
                self.dirty.store(true, Ordering::SeqCst);
                self.emit_event(ReconcilerEvent::PersistFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    /// Emit a reconciler event
    fn emit_event(&self, event: ReconcilerEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event (see event_channel_capacity)");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("No event receiver, dropping event");
            }
        }
    }
}
