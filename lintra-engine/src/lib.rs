//! Streaming pipeline orchestration for incremental document translation
//!
//! Builds on `lintra-core`: the [`DocumentChunker`] splits a document
//! along syntactic boundaries, the [`StreamingPipeline`] processes chunks
//! sequentially, on a bounded worker pool, or with adaptive sizing, and
//! reassembles ordered output from the result buffer.
//!
//! ```rust,ignore
//! let pipeline = StreamingPipeline::new(
//!     PipelineConfig::parallel(),
//!     parser,
//!     translator,
//!     assembler,
//! )?;
//! let cancel = CancellationToken::new();
//! let results: Vec<_> = pipeline.stream(&source, None, cancel, None)?.collect();
//! let output = pipeline.assemble(results.len())?;
//! ```

pub mod cancel;
pub mod chunker;
pub mod config;
pub mod error;
mod executor;
pub mod pipeline;
pub mod progress;

pub use cancel::CancellationToken;
pub use chunker::{ChunkStream, ChunkerConfig, DocumentChunker};
pub use config::PipelineConfig;
pub use error::{EngineError, Result};
pub use pipeline::{ResultStream, StreamingPipeline};
pub use progress::{Progress, ProgressCallback};
