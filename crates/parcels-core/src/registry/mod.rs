//! Plugin-based backend registry
//!
//! The registry maps backend names to factories so the daemon can build a
//! tracking API and a state store from configuration without hard-coded
//! if-else chains. It is an ordinary value owned by whoever composes the
//! system; there is no process-wide instance.
//!
//! ## Registration
//!
//! Implementations should register themselves during initialization:
//!
//! ```rust,ignore
//! // In parcels-api-http crate
//! pub fn register(registry: &BackendRegistry) {
//!     registry.register_api("parcels_app", Box::new(ParcelsAppFactory));
//! }
//! ```

use crate::config::{ApiConfig, StateStoreConfig};
use crate::error::{Error, Result};
use crate::state::{FileStateStoreFactory, MemoryStateStoreFactory};
use crate::traits::{StateStore, StateStoreFactory, TrackingApi, TrackingApiFactory};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Registry of tracking API and state store factories
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct BackendRegistry {
    /// Registered tracking API factories
    apis: RwLock<HashMap<String, Box<dyn TrackingApiFactory>>>,

    /// Registered state store factories
    state_stores: RwLock<HashMap<String, Arc<dyn StateStoreFactory>>>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `file` and `memory` stores
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_state_store("file", Box::new(FileStateStoreFactory));
        registry.register_state_store("memory", Box::new(MemoryStateStoreFactory));
        registry
    }

    /// Register a tracking API factory
    pub fn register_api(&self, name: impl Into<String>, factory: Box<dyn TrackingApiFactory>) {
        let mut apis = self.apis.write().unwrap_or_else(|e| e.into_inner());
        apis.insert(name.into(), factory);
    }

    /// Register a state store factory
    pub fn register_state_store(
        &self,
        name: impl Into<String>,
        factory: Box<dyn StateStoreFactory>,
    ) {
        let mut stores = self.state_stores.write().unwrap_or_else(|e| e.into_inner());
        stores.insert(name.into(), Arc::from(factory));
    }

    /// Create a tracking API from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn TrackingApi>)`: Created API instance
    /// - `Err(Error)`: If the API type is not registered or creation fails
    pub fn create_api(&self, config: &ApiConfig) -> Result<Box<dyn TrackingApi>> {
        let api_type = config.type_name();
        let apis = self.apis.read().unwrap_or_else(|e| e.into_inner());

        let factory = apis
            .get(api_type)
            .ok_or_else(|| Error::config(format!("Unknown tracking API type: {}", api_type)))?;

        factory.create(config)
    }

    /// Create a state store from configuration
    pub async fn create_state_store(
        &self,
        config: &StateStoreConfig,
    ) -> Result<Box<dyn StateStore>> {
        let store_type = config.type_name();

        let factory = {
            let stores = self.state_stores.read().unwrap_or_else(|e| e.into_inner());
            stores
                .get(store_type)
                .ok_or_else(|| Error::config(format!("Unknown state store type: {}", store_type)))?
                .clone()
        };

        // Lock released before the async create
        factory.create(config).await
    }

    /// Check if a tracking API type is registered
    pub fn has_api(&self, name: &str) -> bool {
        let apis = self.apis.read().unwrap_or_else(|e| e.into_inner());
        apis.contains_key(name)
    }

    /// Check if a state store type is registered
    pub fn has_state_store(&self, name: &str) -> bool {
        let stores = self.state_stores.read().unwrap_or_else(|e| e.into_inner());
        stores.contains_key(name)
    }

    /// List all registered tracking API types
    pub fn list_apis(&self) -> Vec<String> {
        let apis = self.apis.read().unwrap_or_else(|e| e.into_inner());
        apis.keys().cloned().collect()
    }
}
