//! Error types for the parcel tracking system
//!
//! Remote failures are classified as [`Error::Network`] or [`Error::Parse`];
//! the [`Reconciler`](crate::Reconciler) downgrades both to logged diagnostics
//! so they never abort a batch.

use thiserror::Error;

/// Result type alias for parcel tracking operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the parcel tracking system
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure, timeout, or non-2xx response
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed or unexpected response body
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unknown tracking id
    #[error("Not found: {0}")]
    NotFound(String),

    /// State store-related errors
    #[error("State store error: {0}")]
    StateStore(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a state store error
    pub fn state_store(msg: impl Into<String>) -> Self {
        Self::StateStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error came from talking to the remote service
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Parse(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
