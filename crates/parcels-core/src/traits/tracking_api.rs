// # Tracking API Trait
//
// Defines the interface for talking to the remote parcel tracking service.
//
// ## Remote operations
//
// - `initiate_or_fetch`: start a lookup; the service either hands back a
//   correlation token (lookup pending) or the resolved shipment right away
// - `poll`: fetch a pending lookup by its token
// - `probe`: lightweight health check of the service root
//
// ## Implementations
//
// - Parcels App: `parcels-api-http` crate

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ApiConfig, TrackingConfig};

/// Shipment fields extracted from a remote response
///
/// Every field is optional; an absent field must not erase a value that an
/// earlier response supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipmentPayload {
    /// Remote status string (`delivered`, `archived`, carrier-specific, ...)
    pub status: Option<String>,
    /// Latest status text (`lastState.status`)
    pub message: Option<String>,
    /// Latest location (`lastState.location`)
    pub location: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    /// Detected carrier name (`detectedCarrier.name`)
    pub carrier: Option<String>,
    /// `days_transit` attribute
    pub days_in_transit: Option<u32>,
}

/// Result of starting a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitResult {
    /// Lookup is pending under this correlation token
    Token(String),
    /// The service resolved the shipment immediately
    Shipment(ShipmentPayload),
}

/// Result of polling a pending lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// The service has not finished the lookup
    Pending,
    /// The lookup resolved
    Shipment(ShipmentPayload),
}

/// Health probe result (not persisted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatusSnapshot {
    /// Whether the service root answered with a success status
    pub reachable: bool,
    /// Wall-clock latency of the probe, when a response arrived
    pub latency_ms: Option<u64>,
    /// HTTP status code, when a response arrived
    pub http_code: Option<u16>,
    /// When the probe finished
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl ApiStatusSnapshot {
    /// Snapshot for a probe that never got a response
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            http_code: None,
            checked_at: chrono::Utc::now(),
        }
    }
}

/// Trait for tracking API implementations
///
/// Implementations are stateless and single-shot: one logical remote call per
/// invocation, no retries, no caching, no background tasks. The
/// [`Reconciler`](crate::Reconciler) owns all state and decides when to call.
///
/// # Errors
///
/// - [`Error::Network`](crate::Error::Network): transport failure, timeout or non-2xx
/// - [`Error::Parse`](crate::Error::Parse): malformed or unexpected body
#[async_trait]
pub trait TrackingApi: Send + Sync {
    /// Start a lookup for a tracking id
    async fn initiate_or_fetch(
        &self,
        account: &TrackingConfig,
        tracking_id: &str,
    ) -> Result<InitResult, crate::Error>;

    /// Poll a pending lookup by its correlation token
    async fn poll(&self, account: &TrackingConfig, token: &str)
    -> Result<PollResult, crate::Error>;

    /// Probe the service root
    ///
    /// Never fails: any transport failure is reported as `reachable = false`.
    async fn probe(&self) -> ApiStatusSnapshot;

    /// Get the API name (for logging/debugging)
    fn api_name(&self) -> &'static str;
}

/// Helper trait for constructing tracking APIs from configuration
pub trait TrackingApiFactory: Send + Sync {
    /// Create a TrackingApi instance from configuration
    fn create(&self, config: &ApiConfig) -> Result<Box<dyn TrackingApi>, crate::Error>;
}
