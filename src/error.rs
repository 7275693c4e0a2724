//! Error types for the Turnstile admission engine.
//!
//! Quota exhaustion is not represented here: a rejected call is an ordinary
//! [`Verdict`](crate::ratelimit::Verdict) with `allowed == false`.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy was constructed with out-of-range parameters
    #[error("Invalid policy '{name}': {reason}")]
    InvalidPolicy { name: String, reason: String },

    /// The admission backend could not produce a verdict
    #[error("Admission backend error: {0}")]
    Backend(String),

    /// A background task did not stop cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
