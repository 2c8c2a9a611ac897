// # parcels-core
//
// Core library for the parcel tracking reconciler.
//
// ## Architecture Overview
//
// This library keeps a durable record of tracked shipments in sync with a
// remote parcel tracking service:
// - **TrackingApi**: Trait for the remote lookup/poll/probe operations
// - **StateStore**: Trait for durable storage of the record set
// - **Reconciler**: Owns the record set, manages correlation tokens, merges responses
// - **PollScheduler**: Fixed-interval driver that publishes snapshots to observers
// - **BackendRegistry**: Plugin-based registry for APIs and stores
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from implementations
// 2. **Merge, don't replace**: Thinner responses never erase known fields
// 3. **Plugin-Based**: Backends are registered dynamically, no hard-coded if-else
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Write-through**: The store is saved after every mutation

pub mod traits;
pub mod record;
pub mod reconciler;
pub mod scheduler;
pub mod observer;
pub mod registry;
pub mod config;
pub mod error;
pub mod state;

// Re-export core types for convenience
pub use traits::{
    ApiStatusSnapshot, InitResult, PollResult, ShipmentPayload, StateStore, TrackingApi,
};
pub use record::{RecordSet, ShipmentRecord, ShipmentStatus};
pub use reconciler::{Reconciler, ReconcilerEvent, RefreshOutcome, RefreshSummary};
pub use scheduler::PollScheduler;
pub use observer::{EntityDiff, EntitySet, Snapshot, SnapshotObserver};
pub use registry::BackendRegistry;
pub use config::{ApiConfig, ParcelsConfig, SchedulerConfig, StateStoreConfig, TrackingConfig};
pub use error::{Error, Result};
pub use state::{FileStateStore, MemoryStateStore};
