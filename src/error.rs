//! Error types for the Bouncer admission layer.

use thiserror::Error;

/// Main error type for Bouncer operations.
#[derive(Error, Debug)]
pub enum BouncerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings could not be read or deserialized
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Shared counter backend errors
    #[error("Counter store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The shared backend is down and the failure policy is fail-closed
    #[error("Counter backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A shared backend round trip exceeded its deadline
    #[error("Counter backend timed out after {0}ms")]
    Timeout(u64),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bouncer operations.
pub type Result<T> = std::result::Result<T, BouncerError>;
