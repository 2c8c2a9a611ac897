// # State Store Trait
//
// Defines the interface for durable storage of the tracked record set.
//
// ## Purpose
//
// The store holds the only durable copy of the record set. The reconciler
// writes the whole set through after every mutation (no write-behind
// buffering) and loads it once at startup.
//
// ## Implementations
//
// - File-based: JSON file with atomic writes and backup recovery
// - Memory: non-durable, for tests and ephemeral deployments
//
// ## Usage
//
// ```rust,ignore
// use parcels_core::StateStore;
//
// let store = /* StateStore implementation */;
// let mut records = store.load().await?;
// records.insert("ABC123".into(), ShipmentRecord::new("ABC123"));
// store.save(&records).await?;
// ```

use async_trait::async_trait;

use crate::record::RecordSet;

/// Trait for state store implementations
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage (files, databases, etc.)
/// - ✅ Keep the last loaded/saved snapshot in memory
///
/// ## Forbidden Capabilities
/// - ❌ Buffer writes: `save()` returns only once the snapshot is durable
/// - ❌ Merge or interpret records (owned by `Reconciler`)
/// - ❌ Talk to the tracking API (owned by `Reconciler`)
///
/// Timestamps must survive a `save()`/`load()` round trip unchanged.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the full record set
    ///
    /// # Returns
    ///
    /// - `Ok(RecordSet)`: The stored records (empty if nothing was stored yet)
    /// - `Err(Error)`: Storage error
    async fn load(&self) -> Result<RecordSet, crate::Error>;

    /// Replace the stored record set
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The snapshot is durable
    /// - `Err(Error)`: Storage error (the caller keeps its in-memory state)
    async fn save(&self, records: &RecordSet) -> Result<(), crate::Error>;
}

/// Helper trait for constructing state stores from configuration
#[async_trait]
pub trait StateStoreFactory: Send + Sync {
    /// Create a StateStore instance from configuration
    async fn create(
        &self,
        config: &crate::config::StateStoreConfig,
    ) -> Result<Box<dyn StateStore>, crate::Error>;
}
