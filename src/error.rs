//! Error types for query cache operations
//!
//! Transport failures are not represented here: they are stored on the cache
//! entry they belong to (see [`crate::cache::TransportError`]) and observed
//! through selectors. This enum covers caller and construction defects.

use thiserror::Error;

/// Main error type for query cache operations
#[derive(Error, Debug)]
pub enum QueryCacheError {
    /// An operation was invoked on a handle whose API has not been finalized yet
    #[error("`{operation}` called before the API was finalized")]
    NotFinalized { operation: &'static str },

    /// `finalize` was called on a builder whose handles are already armed
    #[error("API has already been finalized")]
    AlreadyFinalized,

    /// The key resolver could not produce a cache key
    #[error("Failed to resolve cache key for endpoint '{endpoint}': {reason}")]
    KeyResolution { endpoint: String, reason: String },

    /// No endpoint with that name has been registered
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// A query endpoint was used as a mutation or the other way around
    #[error("Endpoint '{endpoint}' is not a {expected} endpoint")]
    EndpointKindMismatch {
        endpoint: String,
        expected: &'static str,
    },

    /// Two endpoints were registered under the same name
    #[error("Endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    /// The builder was finalized without a transport
    #[error("No transport configured")]
    MissingTransport,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for query cache operations
pub type Result<T> = std::result::Result<T, QueryCacheError>;

impl From<String> for QueryCacheError {
    fn from(s: String) -> Self {
        QueryCacheError::Other(s)
    }
}

impl From<&str> for QueryCacheError {
    fn from(s: &str) -> Self {
        QueryCacheError::Other(s.to_string())
    }
}
