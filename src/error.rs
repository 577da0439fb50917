//! Error types for the slidelimit crate.

use thiserror::Error;

use crate::ratelimit::Policy;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration sources could not be merged or deserialized
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// The caller passed a key the limiter cannot account against
    #[error("Invalid rate limit key: {0}")]
    InvalidKey(String),

    /// A bound key was checked against a different policy
    #[error("Policy mismatch for key {key}: bound to {bound}, requested {requested}")]
    PolicyMismatch {
        key: String,
        bound: Policy,
        requested: Policy,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
