//! Test doubles and common utilities for reconciler contract tests
//!
//! The doubles are cheap to clone: every clone shares the same counters and
//! scripted responses, so a test can hand one clone to the Reconciler and
//! keep another to inspect what happened.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use parcels_core::config::TrackingConfig;
use parcels_core::error::{Error, Result};
use parcels_core::observer::{Snapshot, SnapshotObserver};
use parcels_core::record::{RecordSet, ShipmentRecord, ShipmentStatus};
use parcels_core::state::MemoryStateStore;
use parcels_core::traits::{
    ApiStatusSnapshot, InitResult, PollResult, ShipmentPayload, StateStore, TrackingApi,
};
use parcels_core::ParcelsConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A TrackingApi that replays queued responses
///
/// When a queue is empty, `initiate_or_fetch` issues `token-<id>` and `poll`
/// reports the lookup as still pending.
#[derive(Clone, Default)]
pub struct ScriptedApi {
    init_responses: Arc<Mutex<VecDeque<Result<InitResult>>>>,
    poll_responses: Arc<Mutex<VecDeque<Result<PollResult>>>>,
    init_calls: Arc<AtomicUsize>,
    poll_calls: Arc<AtomicUsize>,
    probe_calls: Arc<AtomicUsize>,
    initiated_ids: Arc<Mutex<Vec<String>>>,
    polled_tokens: Arc<Mutex<Vec<String>>>,
    unreachable: Arc<AtomicBool>,
    /// When set, `initiate_or_fetch` waits on this before answering
    gate: Option<Arc<Notify>>,
    /// Signalled when a gated call has started
    started: Arc<Notify>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `initiate_or_fetch` wait until the returned gate is notified
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let api = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (api, gate)
    }

    pub fn push_init(&self, response: Result<InitResult>) {
        self.init_responses.lock().unwrap().push_back(response);
    }

    pub fn push_poll(&self, response: Result<PollResult>) {
        self.poll_responses.lock().unwrap().push_back(response);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Total remote calls excluding probes
    pub fn network_calls(&self) -> usize {
        self.init_calls() + self.poll_calls()
    }

    pub fn initiated_ids(&self) -> Vec<String> {
        self.initiated_ids.lock().unwrap().clone()
    }

    pub fn polled_tokens(&self) -> Vec<String> {
        self.polled_tokens.lock().unwrap().clone()
    }

    /// Wait until a gated call is parked on the gate
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait::async_trait]
impl TrackingApi for ScriptedApi {
    async fn initiate_or_fetch(
        &self,
        _account: &TrackingConfig,
        tracking_id: &str,
    ) -> Result<InitResult> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.initiated_ids
            .lock()
            .unwrap()
            .push(tracking_id.to_string());

        if let Some(gate) = &self.gate {
            self.started.notify_one();
            gate.notified().await;
        }

        let scripted = self.init_responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(InitResult::Token(format!("token-{}", tracking_id))))
    }

    async fn poll(&self, _account: &TrackingConfig, token: &str) -> Result<PollResult> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polled_tokens.lock().unwrap().push(token.to_string());

        let scripted = self.poll_responses.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(PollResult::Pending))
    }

    async fn probe(&self) -> ApiStatusSnapshot {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return ApiStatusSnapshot::unreachable();
        }
        ApiStatusSnapshot {
            reachable: true,
            latency_ms: Some(12),
            http_code: Some(200),
            checked_at: Utc::now(),
        }
    }

    fn api_name(&self) -> &'static str {
        "scripted"
    }
}

/// A memory-backed StateStore that counts saves and can be told to fail
#[derive(Clone, Default)]
pub struct CountingStateStore {
    inner: MemoryStateStore,
    saves: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl CountingStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordSet) -> Self {
        Self {
            inner: MemoryStateStore::with_records(records),
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// What is currently durable
    pub async fn stored(&self) -> RecordSet {
        self.inner.load().await.unwrap()
    }
}

#[async_trait::async_trait]
impl StateStore for CountingStateStore {
    async fn load(&self) -> Result<RecordSet> {
        self.inner.load().await
    }

    async fn save(&self, records: &RecordSet) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::state_store("disk full"));
        }
        self.inner.save(records).await
    }
}

/// An observer that keeps every snapshot it receives
#[derive(Clone, Default)]
pub struct RecordingObserver {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Snapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

impl SnapshotObserver for RecordingObserver {
    fn on_snapshot(&self, snapshot: &Snapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

/// Create a minimal valid configuration for testing
pub fn minimal_config() -> ParcelsConfig {
    ParcelsConfig::new("test-key", "United States")
}

/// A resolved payload with just a status and a status message
pub fn payload(status: &str, message: &str) -> ShipmentPayload {
    ShipmentPayload {
        status: Some(status.to_string()),
        message: Some(message.to_string()),
        ..ShipmentPayload::default()
    }
}

/// A pending record holding `token`, issued `age` before now
pub fn record_with_token(tracking_id: &str, token: &str, age: Duration) -> ShipmentRecord {
    let mut record = ShipmentRecord::new(tracking_id);
    record.apply_token(token, Utc::now() - age);
    record
}

/// A record in `status`, last updated `age` before now
pub fn record_in_status(
    tracking_id: &str,
    status: ShipmentStatus,
    age: Duration,
) -> ShipmentRecord {
    let mut record = ShipmentRecord::new(tracking_id);
    record.status = status;
    record.last_updated = Some(Utc::now() - age);
    record
}

pub fn record_set(records: Vec<ShipmentRecord>) -> RecordSet {
    records
        .into_iter()
        .map(|record| (record.tracking_id.clone(), record))
        .collect()
}

/// Whether `at` lies within a few seconds of now
pub fn is_recent(at: Option<DateTime<Utc>>) -> bool {
    at.is_some_and(|at| (Utc::now() - at).num_seconds().abs() < 5)
}
