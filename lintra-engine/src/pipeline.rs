//! Streaming pipeline orchestration
//!
//! The pipeline decides whether to stream, drives the chunker (fixed or
//! adaptive sizing), processes chunks sequentially or on a bounded worker
//! pool, records results into the buffer, and reassembles output by index.
//!
//! A stream is a finite, single-pass iterator of [`ChunkResult`]s. Under
//! parallel processing results arrive in completion order; [`StreamingPipeline::assemble`]
//! restores original order from the buffer.

use crate::cancel::CancellationToken;
use crate::chunker::{adaptive_cut, context_tail, ChunkStream, DocumentChunker};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::executor::{build_pool, ParallelRun, ProcessFn};
use crate::progress::{Progress, ProgressCallback, ProgressReporter};
use lintra_core::chunk::{Chunk, ChunkBoundary, ChunkMetadata, ChunkResult};
use lintra_core::document::{Block, BlockKind};
use lintra_core::traits::{Assembler, Parser, TelemetryRecorder, TranslationManager};
use lintra_core::{
    AdaptiveChunkSizer, NoopTelemetry, ParseCache, ParseMode, ResultBuffer, ResultBufferConfig,
    TranslationContext,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Orchestrates chunked, incremental translation of one document at a time
pub struct StreamingPipeline {
    config: PipelineConfig,
    chunker: DocumentChunker,
    ctx: Arc<ProcessCtx>,
    assembler: Arc<dyn Assembler>,
    buffer: Arc<ResultBuffer>,
}

impl StreamingPipeline {
    /// Create a pipeline around the external collaborators
    pub fn new(
        config: PipelineConfig,
        parser: Arc<dyn Parser>,
        translator: Arc<dyn TranslationManager>,
        assembler: Arc<dyn Assembler>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = DocumentChunker::new(config.chunker.clone(), Arc::clone(&parser))?;
        let buffer = Arc::new(ResultBuffer::new(ResultBufferConfig::default())?);
        let ctx = Arc::new(ProcessCtx {
            parser,
            translator,
            telemetry: Arc::new(NoopTelemetry),
            cache: None,
            buffer: Arc::clone(&buffer),
            context_window: config.context_window_size,
        });
        Ok(Self {
            config,
            chunker,
            ctx,
            assembler,
            buffer,
        })
    }

    /// Route chunk parsing through a shared parse cache
    pub fn with_cache(mut self, cache: Arc<ParseCache>) -> Self {
        Arc::make_mut(&mut self.ctx).cache = Some(cache);
        self
    }

    /// Record telemetry events to the given sink
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryRecorder>) -> Self {
        Arc::make_mut(&mut self.ctx).telemetry = telemetry;
        self
    }

    /// Replace the result buffer configuration
    pub fn with_buffer_config(mut self, config: ResultBufferConfig) -> Result<Self> {
        self.buffer = Arc::new(ResultBuffer::new(config)?);
        Arc::make_mut(&mut self.ctx).buffer = Arc::clone(&self.buffer);
        Ok(self)
    }

    /// The buffer holding intermediate results
    pub fn buffer(&self) -> &Arc<ResultBuffer> {
        &self.buffer
    }

    /// Whether `source` is large enough to warrant streaming
    pub fn should_stream(&self, source: &str) -> bool {
        source.len() > self.config.streaming_threshold
    }

    /// Process `source` as a finite, single-pass stream of chunk results
    ///
    /// The stream yields in processing order: submission order when
    /// sequential, completion order when parallel. It is not restartable;
    /// collect what you need and call [`StreamingPipeline::assemble`] for
    /// ordered output. Cancellation is observed at chunk boundaries.
    pub fn stream(
        &self,
        source: &str,
        filename: Option<&str>,
        cancel: CancellationToken,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<ResultStream> {
        self.ctx.telemetry.record_event(
            "stream.start",
            None,
            &[("bytes", source.len() as u64)],
        );
        tracing::info!(
            bytes = source.len(),
            parallel = self.config.parallel,
            adaptive = self.config.adaptive,
            "stream starting"
        );

        let progress = Arc::new(Mutex::new(Progress::default()));
        let state = if self.config.adaptive {
            StreamState::Adaptive {
                source: source.to_string(),
                offset: 0,
                line: 0,
                next_index: 0,
                sizer: AdaptiveChunkSizer::new(self.config.sizer.clone())?,
                default_size: self.config.chunker.max_chunk_size,
                prior_tail: String::new(),
            }
        } else {
            let chunks = self.chunker.stream(source, filename)?;
            set_total(&progress, chunks.len());
            if self.config.parallel {
                self.parallel_state(chunks, filename, &cancel)?
            } else {
                StreamState::Sequential {
                    chunks,
                    prior_tail: String::new(),
                }
            }
        };

        let reporter = progress_callback.map(|callback| {
            ProgressReporter::spawn(
                Arc::clone(&progress),
                self.config.progress_interval,
                callback,
            )
        });

        Ok(ResultStream {
            state,
            ctx: Arc::clone(&self.ctx),
            filename: filename.map(str::to_string),
            progress,
            reporter,
            cancel,
            cancel_reported: false,
        })
    }

    fn parallel_state(
        &self,
        chunks: ChunkStream,
        filename: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StreamState> {
        let chunks: Vec<Chunk> = chunks.collect();
        // Fixed chunking: every chunk's context is known up front
        let contexts: Vec<String> = std::iter::once(String::new())
            .chain(chunks.windows(2).map(|pair| {
                context_tail(pair[0].own_content(), self.ctx.context_window).to_string()
            }))
            .collect();
        let own_sizes: Arc<Vec<usize>> =
            Arc::new(chunks.iter().map(|chunk| chunk.own_content().len()).collect());

        let ctx = Arc::clone(&self.ctx);
        let filename = filename.map(str::to_string);
        let process: ProcessFn = Arc::new(move |chunk: Chunk| {
            let context = contexts.get(chunk.index).map(String::as_str).unwrap_or("");
            ctx.process_chunk(&chunk, context, filename.as_deref())
        });

        let run = ParallelRun::new(
            build_pool(self.config.worker_threads)?,
            chunks,
            self.config.submission_window(),
            self.config.chunk_timeout,
            cancel.clone(),
            process,
            Arc::clone(&self.ctx.telemetry),
        );
        Ok(StreamState::Parallel { run, own_sizes })
    }

    /// Reassemble buffered results in original chunk order
    ///
    /// Walks indices `0..total_chunks`, restores translated blocks (or the
    /// passthrough blocks of failed chunks), and hands them to the external
    /// assembler. Missing indices are logged and skipped.
    pub fn assemble(&self, total_chunks: usize) -> Result<String> {
        let started = Instant::now();
        let mut blocks: Vec<Block> = Vec::new();
        let mut missing = 0u64;

        for index in 0..total_chunks {
            let Some(payload) = self.buffer.get(index) else {
                missing += 1;
                tracing::warn!(index, "no buffered result for chunk");
                continue;
            };
            let result: ChunkResult = serde_json::from_slice(&payload)?;
            blocks.extend(result.translated);
        }

        let output = self.assembler.assemble(&blocks)?;
        self.ctx.telemetry.record_event(
            "assemble.complete",
            Some(started.elapsed()),
            &[("chunks", total_chunks as u64), ("missing", missing)],
        );
        Ok(output)
    }
}

/// Shared per-chunk processing context
struct ProcessCtx {
    parser: Arc<dyn Parser>,
    translator: Arc<dyn TranslationManager>,
    telemetry: Arc<dyn TelemetryRecorder>,
    cache: Option<Arc<ParseCache>>,
    buffer: Arc<ResultBuffer>,
    context_window: usize,
}

impl Clone for ProcessCtx {
    fn clone(&self) -> Self {
        Self {
            parser: Arc::clone(&self.parser),
            translator: Arc::clone(&self.translator),
            telemetry: Arc::clone(&self.telemetry),
            cache: self.cache.clone(),
            buffer: Arc::clone(&self.buffer),
            context_window: self.context_window,
        }
    }
}

impl ProcessCtx {
    /// Process one chunk end to end
    ///
    /// The chunk's own content is parsed with a context prefix (the prior
    /// chunk's tail, or the overlap already baked into the content); blocks
    /// that end inside the prefix are dropped so reassembly never
    /// duplicates context. Per-block translation failures keep the original
    /// block and record a warning. A parse failure yields a failed result
    /// carrying the raw content as a passthrough block.
    fn process_chunk(&self, chunk: &Chunk, prior_tail: &str, filename: Option<&str>) -> ChunkResult {
        let started = Instant::now();

        let (parse_source, prefix_len) = if chunk.metadata.has_overlap {
            (chunk.content.clone(), chunk.metadata.overlap_bytes)
        } else if prior_tail.is_empty() {
            (chunk.content.clone(), 0)
        } else {
            (format!("{prior_tail}{}", chunk.content), prior_tail.len())
        };
        let prefix_lines = parse_source[..prefix_len].matches('\n').count();

        let (document, mut warnings) = match self.parse(&parse_source, filename) {
            Ok(parsed) => parsed,
            Err(err) => {
                let passthrough = vec![Block {
                    kind: BlockKind::Code,
                    content: chunk.own_content().to_string(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    start_byte: chunk.start_byte,
                    end_byte: chunk.end_byte,
                }];
                return ChunkResult::failed(
                    chunk.index,
                    err.to_string(),
                    passthrough,
                    started.elapsed(),
                );
            }
        };

        let blocks: Vec<Block> = document
            .top_level_blocks()
            .into_iter()
            .filter(|block| block.end_byte > prefix_len)
            .map(|block| rebase_block(block, chunk, prefix_len, prefix_lines))
            .collect();

        let mut translated = Vec::with_capacity(blocks.len());
        for block in &blocks {
            if !block.kind.is_natural_language() {
                translated.push(block.clone());
                continue;
            }
            let local_start = (block.start_byte + prefix_len).saturating_sub(chunk.start_byte);
            let context = TranslationContext {
                chunk_index: chunk.index,
                preceding_code: context_tail(
                    &parse_source[..local_start.min(parse_source.len())],
                    self.context_window,
                )
                .to_string(),
            };
            match self.translator.translate_block(&block.content, &context) {
                Ok(code) => translated.push(Block {
                    content: code,
                    ..block.clone()
                }),
                Err(err) => {
                    warnings.push(format!("block at line {}: {err}", block.start_line));
                    translated.push(block.clone());
                }
            }
        }

        let elapsed = started.elapsed();
        self.telemetry.record_event(
            "chunk.processed",
            Some(elapsed),
            &[
                ("index", chunk.index as u64),
                ("blocks", blocks.len() as u64),
            ],
        );
        ChunkResult::succeeded(chunk.index, blocks, translated, warnings, elapsed)
    }

    fn parse(
        &self,
        source: &str,
        filename: Option<&str>,
    ) -> std::result::Result<(Arc<lintra_core::Document>, Vec<String>), lintra_core::ParseError>
    {
        match &self.cache {
            Some(cache) => {
                let document = cache.parse(source, filename, ParseMode::Full)?;
                Ok((document, Vec::new()))
            }
            None => {
                let parsed = self.parser.parse(source, filename)?;
                Ok((Arc::new(parsed.document), parsed.warnings))
            }
        }
    }

    /// Serialize and buffer one result, then fold it into progress
    fn record_result(&self, result: &ChunkResult, own_bytes: usize, progress: &Arc<Mutex<Progress>>) {
        match serde_json::to_vec(result) {
            Ok(payload) => {
                if !self.buffer.add(result.index, &payload) {
                    tracing::warn!(index = result.index, "result buffer rejected chunk result");
                }
            }
            Err(err) => {
                tracing::warn!(index = result.index, error = %err, "chunk result serialization failed");
            }
        }

        let mut progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.processed_chunks += 1;
        progress.bytes_processed += own_bytes;
        if let Some(error) = &result.error {
            progress.errors.push(error.clone());
        }
        progress.warnings.extend(result.warnings.iter().cloned());
    }
}

fn set_total(progress: &Arc<Mutex<Progress>>, total: usize) {
    progress
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .total_chunks = Some(total);
}

/// Shift a block from parse-local coordinates into document coordinates
fn rebase_block(block: Block, chunk: &Chunk, prefix_len: usize, prefix_lines: usize) -> Block {
    Block {
        start_line: chunk.start_line + block.start_line.saturating_sub(prefix_lines),
        end_line: chunk.start_line + block.end_line.saturating_sub(prefix_lines),
        start_byte: chunk.start_byte + block.start_byte.saturating_sub(prefix_len),
        end_byte: chunk.start_byte + block.end_byte.saturating_sub(prefix_len),
        ..block
    }
}

enum StreamState {
    Sequential {
        chunks: ChunkStream,
        prior_tail: String,
    },
    Adaptive {
        source: String,
        offset: usize,
        line: usize,
        next_index: usize,
        sizer: AdaptiveChunkSizer,
        default_size: usize,
        prior_tail: String,
    },
    Parallel {
        run: ParallelRun,
        own_sizes: Arc<Vec<usize>>,
    },
    Done,
}

/// Finite, single-pass stream of chunk results
///
/// Exhausted once `next` returns `None`; not restartable. Dropping the
/// stream stops the progress reporter after a final report.
pub struct ResultStream {
    state: StreamState,
    ctx: Arc<ProcessCtx>,
    filename: Option<String>,
    progress: Arc<Mutex<Progress>>,
    reporter: Option<ProgressReporter>,
    cancel: CancellationToken,
    cancel_reported: bool,
}

impl ResultStream {
    /// Progress so far; also handed to the progress callback periodically
    pub fn progress(&self) -> Progress {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn finish(&mut self) {
        self.state = StreamState::Done;
        if let Some(mut reporter) = self.reporter.take() {
            reporter.stop();
        }
    }

    fn observe_cancellation(&mut self) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        if !self.cancel_reported {
            self.cancel_reported = true;
            self.ctx.telemetry.record_event("stream.cancelled", None, &[]);
            tracing::info!("stream cancelled");
        }
        true
    }
}

impl Iterator for ResultStream {
    type Item = ChunkResult;

    fn next(&mut self) -> Option<ChunkResult> {
        let next = match &mut self.state {
            StreamState::Done => None,
            StreamState::Sequential { chunks, prior_tail } => {
                if self.cancel.is_cancelled() {
                    None
                } else {
                    chunks.next().map(|chunk| {
                        let result =
                            self.ctx
                                .process_chunk(&chunk, prior_tail, self.filename.as_deref());
                        *prior_tail =
                            context_tail(chunk.own_content(), self.ctx.context_window).to_string();
                        (result, chunk.own_content().len())
                    })
                }
            }
            StreamState::Adaptive {
                source,
                offset,
                line,
                next_index,
                sizer,
                default_size,
                prior_tail,
            } => {
                if self.cancel.is_cancelled() || *offset >= source.len() {
                    None
                } else {
                    let target = sizer.get_next_size(*default_size);
                    let end = adaptive_cut(source, *offset, target);
                    let content = &source[*offset..end];
                    let newline_count = content.matches('\n').count();
                    let chunk = Chunk {
                        content: content.to_string(),
                        start_line: *line,
                        end_line: *line + newline_count + usize::from(!content.ends_with('\n')),
                        start_byte: *offset,
                        end_byte: end,
                        index: *next_index,
                        total_count: None,
                        metadata: ChunkMetadata::plain(ChunkBoundary::Adaptive),
                    };
                    let result =
                        self.ctx
                            .process_chunk(&chunk, prior_tail, self.filename.as_deref());
                    sizer.update_feedback(
                        chunk.len(),
                        result.processing_time,
                        self.ctx.buffer.utilization(),
                        None,
                    );
                    *prior_tail =
                        context_tail(chunk.own_content(), self.ctx.context_window).to_string();
                    *offset = end;
                    *line += newline_count;
                    *next_index += 1;
                    Some((result, chunk.len()))
                }
            }
            StreamState::Parallel { run, own_sizes } => run.next().map(|result| {
                let own = own_sizes.get(result.index).copied().unwrap_or(0);
                (result, own)
            }),
        };

        match next {
            Some((result, own_bytes)) => {
                self.ctx.record_result(&result, own_bytes, &self.progress);
                Some(result)
            }
            None => {
                self.observe_cancellation();
                self.finish();
                None
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.finish();
    }
}
