//! Configuration types for the parcel tracking system
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParcelsConfig {
    /// Per-instance tracking settings handed to the reconciler
    pub tracking: TrackingConfig,

    /// Tracking API backend
    #[serde(default)]
    pub api: ApiConfig,

    /// State store configuration
    #[serde(default)]
    pub state_store: StateStoreConfig,

    /// Poll scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl ParcelsConfig {
    /// Create a configuration with defaults for everything except credentials
    pub fn new(api_key: impl Into<String>, destination_country: impl Into<String>) -> Self {
        Self {
            tracking: TrackingConfig::new(api_key, destination_country),
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.tracking.validate()?;
        self.api.validate()?;
        self.state_store.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Longest accepted correlation token lifetime (one year)
pub const MAX_TOKEN_TTL_SECS: u64 = 86_400 * 365;

/// Longest accepted retention window for delivered shipments
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Settings that identify one tracking account
///
/// Each [`Reconciler`](crate::Reconciler) owns its own copy; there is no
/// process-wide table of accounts.
#[derive(Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Parcels App API key
    /// ⚠️ NEVER log this value
    pub api_key: String,

    /// Destination country sent with every tracking request
    pub destination_country: String,

    /// Response language
    #[serde(default = "default_language")]
    pub language: String,

    /// Lifetime of a correlation token before it is re-requested (in seconds)
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Days a delivered/archived shipment is kept before pruning
    ///
    /// `None` or `Some(0)` disables pruning.
    #[serde(default = "default_retention_days")]
    pub retention_days: Option<u64>,
}

// Custom Debug implementation that hides the API key
impl std::fmt::Debug for TrackingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingConfig")
            .field("api_key", &"<REDACTED>")
            .field("destination_country", &self.destination_country)
            .field("language", &self.language)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl TrackingConfig {
    /// Create tracking settings with the default language, TTL and retention
    pub fn new(api_key: impl Into<String>, destination_country: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            destination_country: destination_country.into(),
            language: default_language(),
            token_ttl_secs: default_token_ttl_secs(),
            retention_days: default_retention_days(),
        }
    }

    /// Set the response language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the retention window (`None` disables pruning)
    pub fn with_retention_days(mut self, retention_days: Option<u64>) -> Self {
        self.retention_days = retention_days;
        self
    }

    /// Token lifetime as a chrono duration
    ///
    /// Values past [`MAX_TOKEN_TTL_SECS`] are clamped to it.
    pub fn token_ttl(&self) -> chrono::Duration {
        let secs = self.token_ttl_secs.min(MAX_TOKEN_TTL_SECS);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::zero())
    }

    /// Retention window, if pruning is enabled
    ///
    /// Values past [`MAX_RETENTION_DAYS`] are clamped to it.
    pub fn retention(&self) -> Option<chrono::Duration> {
        let days = self.retention_days.filter(|days| *days > 0)?;
        i64::try_from(days.min(MAX_RETENTION_DAYS))
            .ok()
            .and_then(chrono::Duration::try_days)
    }

    /// Validate the tracking settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.api_key.trim().is_empty() {
            return Err(crate::Error::config("API key cannot be empty"));
        }
        if self.destination_country.trim().is_empty() {
            return Err(crate::Error::config("Destination country cannot be empty"));
        }
        if self.language.trim().is_empty() {
            return Err(crate::Error::config("Language cannot be empty"));
        }
        if self.token_ttl_secs == 0 {
            return Err(crate::Error::config("Token TTL must be > 0"));
        }
        if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(crate::Error::config(format!(
                "Token TTL must be <= {MAX_TOKEN_TTL_SECS} seconds"
            )));
        }
        if self.retention_days.is_some_and(|days| days > MAX_RETENTION_DAYS) {
            return Err(crate::Error::config(format!(
                "Retention must be <= {MAX_RETENTION_DAYS} days"
            )));
        }
        Ok(())
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::new(String::new(), String::new())
    }
}

/// Tracking API backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiConfig {
    /// The Parcels App HTTP API
    ParcelsApp {
        /// Service root (the health probe hits this URL)
        #[serde(default = "default_base_url")]
        base_url: String,
        /// Timeout for tracking requests (in seconds)
        #[serde(default = "default_http_timeout_secs")]
        timeout_secs: u64,
    },

    /// Custom tracking API
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl ApiConfig {
    /// Validate the API configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            ApiConfig::ParcelsApp {
                base_url,
                timeout_secs,
            } => {
                if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
                    return Err(crate::Error::config(format!(
                        "API base URL must use HTTP or HTTPS scheme. Got: {}",
                        base_url
                    )));
                }
                if *timeout_secs == 0 {
                    return Err(crate::Error::config("API timeout must be > 0"));
                }
                Ok(())
            }
            ApiConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom API factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom API config cannot be null"));
                }
                Ok(())
            }
        }
    }

    /// Get the API type name
    pub fn type_name(&self) -> &str {
        match self {
            ApiConfig::ParcelsApp { .. } => "parcels_app",
            ApiConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig::ParcelsApp {
            base_url: default_base_url(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// State store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateStoreConfig {
    /// File-based state store
    File {
        /// Path to the state file
        path: String,
    },

    /// In-memory state store (not persistent)
    #[default]
    Memory,

    /// Custom state store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl StateStoreConfig {
    /// Validate the state store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StateStoreConfig::File { path } if path.is_empty() => {
                Err(crate::Error::config("State file path cannot be empty"))
            }
            StateStoreConfig::Custom { factory, .. } if factory.is_empty() => Err(
                crate::Error::config("Custom state store factory cannot be empty"),
            ),
            _ => Ok(()),
        }
    }

    /// Get the store type name
    pub fn type_name(&self) -> &str {
        match self {
            StateStoreConfig::File { .. } => "file",
            StateStoreConfig::Memory => "memory",
            StateStoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Poll scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between poll cycles (in seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Capacity of the reconciler event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl SchedulerConfig {
    /// Validate the scheduler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("Poll interval must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

fn default_token_ttl_secs() -> u64 {
    30 * 60
}

fn default_retention_days() -> Option<u64> {
    Some(30)
}

fn default_base_url() -> String {
    "https://parcelsapp.com".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    900
}

fn default_event_channel_capacity() -> usize {
    100
}
