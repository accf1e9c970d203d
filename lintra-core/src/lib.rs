//! Core data model and bounded resource components for incremental
//! document translation
//!
//! This crate holds the pieces that are independent of pipeline
//! orchestration:
//! - **Data model**: tagged node trees, documents, blocks, and chunks
//! - **Caching**: a bounded, thread-safe parse cache with TTL expiry and
//!   crash-safe snapshot persistence
//! - **Buffering**: a bounded result buffer with transparent compression
//! - **Control**: a feedback-driven adaptive chunk sizer
//! - **Seams**: traits for the external parser, translation backend, and
//!   assembler
//!
//! # Example
//!
//! ```rust
//! use lintra_core::{AdaptiveChunkSizer, SizerConfig};
//! use std::time::Duration;
//!
//! let mut sizer = AdaptiveChunkSizer::new(SizerConfig::default()).unwrap();
//! let first = sizer.get_next_size(16 * 1024);
//!
//! // Latency far above target shrinks the next chunk once the
//! // hysteresis band is left.
//! sizer.update_feedback(first, Duration::from_secs(2), 0.1, None);
//! assert!(sizer.get_next_size(16 * 1024) < first);
//! ```

pub mod buffer;
pub mod cache;
pub mod chunk;
pub mod document;
pub mod error;
pub mod sizer;
pub mod traits;
pub mod tree;

pub use buffer::{BufferEviction, BufferStats, ResultBuffer, ResultBufferConfig};
pub use cache::{CacheStats, EvictionMode, ParseCache, ParseCacheConfig, ParseMode};
pub use chunk::{Chunk, ChunkBoundary, ChunkMetadata, ChunkResult};
pub use document::{Block, BlockKind, Document};
pub use error::{CoreError, Result};
pub use sizer::{AdaptiveChunkSizer, SizerConfig};
pub use traits::{
    AssembleError, Assembler, NoopTelemetry, ParseError, Parsed, Parser, TelemetryRecorder,
    TranslateError, TranslationContext, TranslationManager,
};
pub use tree::{FieldValue, Span, TreeNode, MAX_TREE_DEPTH};
