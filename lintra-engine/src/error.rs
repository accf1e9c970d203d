//! Engine-level error types

use lintra_core::{AssembleError, CoreError, ParseError};
use thiserror::Error;

/// Errors raised by chunking and pipeline orchestration
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error from a core component
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The parser rejected the whole input
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Final assembly failed
    #[error(transparent)]
    Assemble(#[from] AssembleError),

    /// Chunking produced an inconsistent split
    #[error("chunking failed: {reason}")]
    ChunkingFailed {
        /// Why the split is unusable
        reason: String,
    },

    /// Configuration rejected by validation
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Which parameter combination is invalid
        reason: String,
    },

    /// Stored result could not be decoded
    #[error("result decoding failed: {0}")]
    ResultDecoding(#[from] serde_json::Error),

    /// Worker pool could not be constructed
    #[error("worker pool construction failed: {reason}")]
    WorkerPool {
        /// Builder diagnostic
        reason: String,
    },
}

/// Engine result alias
pub type Result<T> = std::result::Result<T, EngineError>;
