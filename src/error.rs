//! Error types for the Tollgate admission layer.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not be reached or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// User identity was requested but no usable bearer token was present
    #[error("No user identity in request")]
    NoIdentity,

    /// A route's custom inline policy is malformed
    #[error("Invalid inline policy for '{prefix}': {reason}")]
    InvalidInlineConfig { prefix: String, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
