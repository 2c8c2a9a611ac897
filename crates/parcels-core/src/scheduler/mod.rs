//! Poll scheduler
//!
//! Drives the reconciler on a fixed interval. Each tick:
//!
//! 1. Probe the tracking service
//! 2. Refresh every non-terminal shipment
//! 3. Retry a failed save, prune stale terminal records
//! 4. Publish the combined snapshot to observers
//!
//! The first tick runs before the loop starts waiting, so observers see
//! state as soon as the scheduler starts. Between ticks, reconciler events
//! (track, remove, prune, manual refresh) republish the snapshot without a
//! new network cycle.

use crate::config::SchedulerConfig;
use crate::observer::{Snapshot, SnapshotObserver};
use crate::reconciler::{Reconciler, ReconcilerEvent};
use crate::traits::ApiStatusSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

/// Fixed-interval driver for a [`Reconciler`]
pub struct PollScheduler {
    reconciler: Arc<Reconciler>,
    events: mpsc::Receiver<ReconcilerEvent>,
    interval: Duration,
    observers: Vec<Box<dyn SnapshotObserver>>,
    last_status: Option<ApiStatusSnapshot>,
}

impl PollScheduler {
    /// Create a scheduler for a reconciler and its event receiver
    pub fn new(
        reconciler: Arc<Reconciler>,
        events: mpsc::Receiver<ReconcilerEvent>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            reconciler,
            events,
            interval: Duration::from_secs(config.interval_secs),
            observers: Vec::new(),
            last_status: None,
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register an observer
    pub fn add_observer(&mut self, observer: Box<dyn SnapshotObserver>) {
        self.observers.push(observer);
    }

    /// Latest probe result, if a tick has run
    pub fn last_status(&self) -> Option<&ApiStatusSnapshot> {
        self.last_status.as_ref()
    }

    /// Run one poll cycle and publish its snapshot
    pub async fn tick(&mut self) -> Snapshot {
        let status = self.reconciler.probe().await;
        if status.reachable {
            debug!(
                "Tracking service reachable (code: {:?}, latency: {:?}ms)",
                status.http_code, status.latency_ms
            );
        } else {
            warn!(
                "Tracking service unreachable (code: {:?})",
                status.http_code
            );
        }
        self.last_status = Some(status.clone());

        let summary = self.reconciler.refresh_all().await;
        debug!("Poll cycle finished: {:?}", summary);

        if let Err(e) = self.reconciler.flush().await {
            error!("Retrying state save failed: {}", e);
        }
        // Pruning publishes through the event channel
        self.reconciler.prune().await;

        let snapshot = Snapshot {
            status,
            shipments: self.reconciler.snapshot().await,
        };
        self.publish(&snapshot);
        snapshot
    }

    /// Run until Ctrl-C
    pub async fn run(self) {
        self.run_internal(None).await
    }

    /// Run until the shutdown receiver fires (or its sender is dropped)
    pub async fn run_with_shutdown(self, shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>) {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(mut self, shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>) {
        info!("Starting poll scheduler (interval={:?})", self.interval);

        // First tick happens now, not one interval from now
        self.tick().await;

        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(interval);

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                Some(_) = ticks.next() => {
                    self.tick().await;
                }

                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
            }
        }

        if let Err(e) = self.reconciler.flush().await {
            error!("Failed to save state on shutdown: {}", e);
        }
        info!("Poll scheduler stopped");
    }

    async fn handle_event(&mut self, event: ReconcilerEvent) {
        match &event {
            ReconcilerEvent::PersistFailed { error } => {
                debug!("Reconciler reported a failed save: {}", error);
                return;
            }
            ReconcilerEvent::Tracked { tracking_id, outcome } => {
                debug!("Shipment {} tracked: {:?}", tracking_id, outcome);
            }
            ReconcilerEvent::Removed { tracking_id } => {
                debug!("Shipment {} removed", tracking_id);
            }
            ReconcilerEvent::Pruned { tracking_ids } => {
                debug!("Pruned shipments: {:?}", tracking_ids);
            }
            ReconcilerEvent::RefreshRequested => {}
        }

        let Some(status) = self.last_status.clone() else {
            return;
        };
        let snapshot = Snapshot {
            status,
            shipments: self.reconciler.snapshot().await,
        };
        self.publish(&snapshot);
    }

    fn publish(&self, snapshot: &Snapshot) {
        for observer in &self.observers {
            observer.on_snapshot(snapshot);
        }
    }
}
