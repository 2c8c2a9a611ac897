// # Memory State Store
//
// In-memory implementation of StateStore.
//
// ## Purpose
//
// Provides a simple, fast state store that doesn't persist across restarts.
// Useful for testing, or deployments where re-requesting every lookup after
// a restart is acceptable.
//
// ## Crash Behavior
//
// - All tracked shipments are lost on restart/crash
// - No recovery possible (state is in-memory only)

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::config::StateStoreConfig;
use crate::record::RecordSet;
use crate::traits::state_store::{StateStore, StateStoreFactory};

/// In-memory state store implementation
///
/// Clones share the same underlying snapshot, so a test can keep a handle
/// and inspect what the reconciler saved.
///
/// # Example
///
/// ```rust,no_run
/// use parcels_core::state::MemoryStateStore;
/// use parcels_core::{RecordSet, ShipmentRecord, StateStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStateStore::new();
///
///     let mut records = RecordSet::new();
///     records.insert("ABC123".to_string(), ShipmentRecord::new("ABC123"));
///     store.save(&records).await?;
///
///     assert_eq!(store.load().await?.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<RwLock<RecordSet>>,
}

impl MemoryStateStore {
    /// Create a new empty memory state store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records
    pub fn with_records(records: RecordSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(records)),
        }
    }

    /// Get the number of records in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<RecordSet, Error> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, records: &RecordSet) -> Result<(), Error> {
        *self.inner.write().await = records.clone();
        Ok(())
    }
}

/// Factory for creating memory state stores
pub struct MemoryStateStoreFactory;

#[async_trait]
impl StateStoreFactory for MemoryStateStoreFactory {
    async fn create(&self, config: &StateStoreConfig) -> Result<Box<dyn StateStore>, Error> {
        match config {
            StateStoreConfig::Memory => Ok(Box::new(MemoryStateStore::new())),
            _ => Err(Error::config("Invalid config for memory state store")),
        }
    }
}
