//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Admission denials are not errors; they are returned as
/// [`Decision`](crate::ratelimit::Decision) values.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid or unparseable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration loading errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
