//! Collaborator seams for the translation pipeline
//!
//! The parser, translation backend, and assembler live outside this
//! workspace; these traits define the contract the pipeline depends on.
//! Tests provide in-crate implementations.

use crate::document::{Block, Document};
use std::time::Duration;
use thiserror::Error;

/// Parser rejected the input
#[derive(Debug, Clone, Error)]
#[error("parse failed: {message}")]
pub struct ParseError {
    /// Parser diagnostic
    pub message: String,
    /// Offending line, when the parser reports one (0-based)
    pub line: Option<usize>,
}

impl ParseError {
    /// Create an error without line information
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }
}

/// A single block failed to translate
#[derive(Debug, Clone, Error)]
#[error("translation failed: {message}")]
pub struct TranslateError {
    /// Backend diagnostic
    pub message: String,
}

impl TranslateError {
    /// Create a translation error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Final assembly failed
#[derive(Debug, Clone, Error)]
#[error("assembly failed: {message}")]
pub struct AssembleError {
    /// Assembler diagnostic
    pub message: String,
}

/// Successful parse output
#[derive(Debug, Clone)]
pub struct Parsed {
    /// The parsed document
    pub document: Document,
    /// Non-fatal parser diagnostics
    pub warnings: Vec<String>,
}

/// Parses source text into a [`Document`]
pub trait Parser: Send + Sync {
    /// Parse `source`, optionally knowing the originating filename
    fn parse(&self, source: &str, filename: Option<&str>) -> Result<Parsed, ParseError>;
}

/// Context handed to the translation backend for one block
#[derive(Debug, Clone, Default)]
pub struct TranslationContext {
    /// Index of the chunk the block came from
    pub chunk_index: usize,
    /// Window of code immediately preceding the block
    pub preceding_code: String,
}

/// Translates natural-language blocks into code
pub trait TranslationManager: Send + Sync {
    /// Translate one block; failures are recovered per block by the caller
    fn translate_block(
        &self,
        text: &str,
        context: &TranslationContext,
    ) -> Result<String, TranslateError>;
}

/// Reassembles translated blocks into final document text
pub trait Assembler: Send + Sync {
    /// Assemble blocks in the given order
    fn assemble(&self, blocks: &[Block]) -> Result<String, AssembleError>;
}

/// Best-effort event sink
pub trait TelemetryRecorder: Send + Sync {
    /// Record a named event with optional duration and counters
    fn record_event(&self, name: &str, duration: Option<Duration>, counters: &[(&str, u64)]);
}

/// Telemetry sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryRecorder for NoopTelemetry {
    fn record_event(&self, _name: &str, _duration: Option<Duration>, _counters: &[(&str, u64)]) {}
}
