//! Error types for the core components

use thiserror::Error;

/// Errors produced by the core components
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration parameters
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration was rejected
        reason: String,
    },

    /// Serialization of a snapshot or entry failed
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistence I/O failure
    #[error("persistence I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted entry had an unknown or invalid shape
    #[error("malformed snapshot entry: {reason}")]
    MalformedEntry {
        /// What was wrong with the entry
        reason: String,
    },
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
