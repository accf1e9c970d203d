//! Chunk data model shared by the chunker and the pipeline

use crate::document::Block;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a chunk's trailing boundary was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkBoundary {
    /// The whole document fit in one chunk
    Whole,
    /// Packed along parsed top-level boundaries
    Syntactic,
    /// Heuristic line-based split
    LineWindow,
    /// Sized on the fly by the adaptive sizer
    Adaptive,
}

/// Metadata attached to every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Boundary kind that produced the chunk
    pub boundary: ChunkBoundary,
    /// Whether the content is prefixed with overlap from the previous chunk
    pub has_overlap: bool,
    /// Exact byte length of the overlap prefix, for stripping
    pub overlap_bytes: usize,
}

impl ChunkMetadata {
    /// Metadata for a chunk without overlap
    pub fn plain(boundary: ChunkBoundary) -> Self {
        Self {
            boundary,
            has_overlap: false,
            overlap_bytes: 0,
        }
    }
}

/// An ordered piece of the source document
///
/// Immutable once produced. `content` may carry an overlap prefix; the
/// byte/line ranges always describe the non-overlap region in the original
/// document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Chunk text, possibly with an overlap prefix
    pub content: String,
    /// First source line (0-based)
    pub start_line: usize,
    /// Line one past the last source line
    pub end_line: usize,
    /// First source byte
    pub start_byte: usize,
    /// Byte one past the chunk's region
    pub end_byte: usize,
    /// Position in the chunk sequence
    pub index: usize,
    /// Total number of chunks, once the full split is known
    pub total_count: Option<usize>,
    /// Boundary and overlap metadata
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Content length in bytes, overlap included
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// True if the chunk carries no content
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Content with any overlap prefix stripped
    pub fn own_content(&self) -> &str {
        &self.content[self.metadata.overlap_bytes..]
    }
}

/// Outcome of processing one chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    /// Index of the originating chunk
    pub index: usize,
    /// Whether the chunk was processed successfully
    pub success: bool,
    /// Parsed intermediate blocks
    pub blocks: Vec<Block>,
    /// Blocks after translation (originals kept on per-block failure)
    pub translated: Vec<Block>,
    /// Fatal error for this chunk, if any
    pub error: Option<String>,
    /// Non-fatal diagnostics
    pub warnings: Vec<String>,
    /// End-to-end processing time for this chunk
    pub processing_time: Duration,
}

impl ChunkResult {
    /// Successful result
    pub fn succeeded(
        index: usize,
        blocks: Vec<Block>,
        translated: Vec<Block>,
        warnings: Vec<String>,
        processing_time: Duration,
    ) -> Self {
        Self {
            index,
            success: true,
            blocks,
            translated,
            error: None,
            warnings,
            processing_time,
        }
    }

    /// Failed result carrying passthrough blocks so assembly can keep the
    /// original text
    pub fn failed(
        index: usize,
        error: impl Into<String>,
        passthrough: Vec<Block>,
        processing_time: Duration,
    ) -> Self {
        Self {
            index,
            success: false,
            blocks: Vec::new(),
            translated: passthrough,
            error: Some(error.into()),
            warnings: Vec::new(),
            processing_time,
        }
    }

    /// Result for a chunk whose processing exceeded the configured timeout
    pub fn timed_out(index: usize, timeout: Duration) -> Self {
        Self {
            index,
            success: false,
            blocks: Vec::new(),
            translated: Vec::new(),
            error: Some(format!(
                "chunk {index} timed out after {} ms",
                timeout.as_millis()
            )),
            warnings: Vec::new(),
            processing_time: timeout,
        }
    }
}
