//! Snapshot observers
//!
//! The scheduler publishes a [`Snapshot`] after every poll cycle and whenever
//! the reconciler signals a change. Observers turn snapshots into whatever
//! the host platform shows; [`EntitySet`] does the add/remove bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::record::RecordSet;
use crate::traits::ApiStatusSnapshot;

/// Point-in-time view of service health plus all tracked shipments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Latest health probe result
    pub status: ApiStatusSnapshot,
    /// All tracked shipments
    pub shipments: RecordSet,
}

/// Receives published snapshots
///
/// Called on the scheduler task; implementations must not block.
pub trait SnapshotObserver: Send + Sync {
    fn on_snapshot(&self, snapshot: &Snapshot);
}

/// Tracking ids that appeared or disappeared between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The set of tracking ids an observer currently exposes
#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    known: BTreeSet<String>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against a snapshot and report what changed
    pub fn apply(&mut self, snapshot: &Snapshot) -> EntityDiff {
        let current: BTreeSet<String> = snapshot.shipments.keys().cloned().collect();

        let diff = EntityDiff {
            added: current.difference(&self.known).cloned().collect(),
            removed: self.known.difference(&current).cloned().collect(),
        };

        self.known = current;
        diff
    }

    pub fn contains(&self, tracking_id: &str) -> bool {
        self.known.contains(tracking_id)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
