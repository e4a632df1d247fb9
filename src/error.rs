//! Error types for Tollgate.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::LimiterSnapshot;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Breaker threshold outside the open interval (0, 1)
    #[error("Sampling breaker threshold should be between (0, 1), got {0}")]
    ThresholdOutOfRange(f64),

    /// The admission driver rejected the call
    #[error("Rate limit exceeded for {hash} ({snapshot})")]
    RateLimitExceeded {
        hash: String,
        snapshot: LimiterSnapshot,
    },

    /// The circuit is open (or a half-open probe is already in flight)
    #[error("Circuit {name} is open")]
    CircuitOpen { name: String },

    /// Shared state store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Faults of the shared state store. These never mean "rate limit exceeded".
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store could not serve the request
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A single store call did not complete in time
    #[error("store call on {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// Optimistic transaction lost every compare-and-swap race
    #[error("transaction on {key} gave up after {attempts} conflicting attempts")]
    Conflict { key: String, attempts: u32 },

    /// A stored document could not be decoded
    #[error("corrupt document at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
