//! Error types for the Turnstile service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Being over quota is not an error; it is reported through
/// [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limit or role tier carried a value that would make throttling meaningless
    #[error("Invalid limit: {field} out of range (got {value})")]
    InvalidLimit { field: &'static str, value: u64 },

    /// A category name that is not part of the table
    #[error("Unknown rate limit category: {0}")]
    UnknownCategory(String),

    /// Counter backing failures
    #[error("Rate limit backend error: {0}")]
    Backend(String),

    /// The counter backing did not answer in time
    #[error("Rate limit backend timed out after {0:?}")]
    BackendTimeout(Duration),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
