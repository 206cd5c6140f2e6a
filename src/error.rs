//! Error types for the cache fleet

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache fleet
///
/// Routine outcomes on the hot path (allocator full, key absent, filter full) are
/// not errors; they are returned as `Option`/enum values by the components that
/// produce them.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// No tier could hold the entry
    #[error("No capacity left for entry of {size} bytes")]
    Capacity { size: usize },

    /// Key exceeds the configured maximum
    #[error("Key of {size} bytes exceeds the {max} byte limit")]
    KeyTooLarge { size: usize, max: usize },

    /// Value exceeds the configured maximum
    #[error("Value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },

    // =========================================================================
    // Fleet Errors
    // =========================================================================
    /// Remote instance did not answer
    #[error("Instance {uid} unavailable: {reason}")]
    RemoteUnavailable { uid: u64, reason: String },

    /// Request to an instance timed out
    #[error("Request to instance {uid} timed out after {timeout_ms}ms")]
    Timeout { uid: u64, timeout_ms: u64 },

    /// Malformed client request
    #[error("Protocol error: {0}")]
    Protocol(String),
}
