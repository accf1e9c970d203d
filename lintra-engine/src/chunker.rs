//! Boundary-respecting document chunking
//!
//! The chunker prefers syntactic boundaries from the parser: top-level
//! blocks partition the source at their start bytes, so the bytes between
//! two blocks always travel with the preceding one and concatenating all
//! chunks reproduces the source byte-for-byte. When parsing fails or
//! boundary respect is disabled, a line-window fallback packs lines and
//! searches backward for a natural break before hard-cutting.

use crate::error::{EngineError, Result};
use lintra_core::chunk::{Chunk, ChunkBoundary, ChunkMetadata};
use lintra_core::traits::Parser;
use std::sync::Arc;

/// Configuration for [`DocumentChunker`]
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target upper bound on chunk size in bytes
    pub max_chunk_size: usize,
    /// Chunks are grown to at least this size when possible
    pub min_chunk_size: usize,
    /// Line cap for the fallback path
    pub max_lines_per_chunk: usize,
    /// Trailing lines of the previous chunk prefixed to the next
    pub overlap_lines: usize,
    /// Prefer parsed top-level boundaries over line windows
    pub respect_boundaries: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 16 * 1024,
            min_chunk_size: 1024,
            max_lines_per_chunk: 400,
            overlap_lines: 0,
            respect_boundaries: true,
        }
    }
}

impl ChunkerConfig {
    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max_chunk_size must be greater than 0".to_string(),
            });
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(EngineError::InvalidConfig {
                reason: "min_chunk_size must not exceed max_chunk_size".to_string(),
            });
        }
        if self.max_lines_per_chunk == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max_lines_per_chunk must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Splits a document into ordered chunks along syntactic boundaries
pub struct DocumentChunker {
    config: ChunkerConfig,
    parser: Arc<dyn Parser>,
}

impl DocumentChunker {
    /// Create a chunker, rejecting invalid configurations
    pub fn new(config: ChunkerConfig, parser: Arc<dyn Parser>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, parser })
    }

    /// Split `source` into ordered chunks
    ///
    /// Inputs within `max_chunk_size` yield one chunk. Otherwise the
    /// boundary-aware path packs parsed top-level regions greedily; parse
    /// failure falls back to line windows. Overlap, when configured, is
    /// applied last.
    pub fn chunk(&self, source: &str, filename: Option<&str>) -> Result<Vec<Chunk>> {
        if source.is_empty() {
            return Ok(Vec::new());
        }

        let line_starts = line_starts(source);
        let mut chunks = if source.len() <= self.config.max_chunk_size {
            vec![make_chunk(
                source,
                &line_starts,
                0,
                source.len(),
                0,
                ChunkBoundary::Whole,
            )]
        } else if self.config.respect_boundaries {
            match self.parser.parse(source, filename) {
                Ok(parsed) => {
                    let blocks = parsed.document.top_level_blocks();
                    if blocks.is_empty() {
                        self.chunk_by_lines(source, &line_starts)
                    } else {
                        let starts: Vec<usize> =
                            blocks.iter().map(|block| block.start_byte).collect();
                        self.pack_regions(source, &line_starts, &starts)
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "parse failed; falling back to line chunking");
                    self.chunk_by_lines(source, &line_starts)
                }
            }
        } else {
            self.chunk_by_lines(source, &line_starts)
        };

        if self.config.overlap_lines > 0 {
            apply_overlap(source, &mut chunks, self.config.overlap_lines);
        }
        Ok(chunks)
    }

    /// Split `source` lazily with totals stamped on every chunk
    ///
    /// The full split is computed up front; the returned iterator is
    /// finite, single-pass, and not restartable.
    pub fn stream(&self, source: &str, filename: Option<&str>) -> Result<ChunkStream> {
        let mut chunks = self.chunk(source, filename)?;
        let total = chunks.len();
        for chunk in &mut chunks {
            chunk.total_count = Some(total);
        }
        Ok(ChunkStream {
            inner: chunks.into_iter(),
        })
    }

    /// Verify that the chunks partition `source` exactly
    ///
    /// Checks contiguity of the byte ranges and byte-for-byte equality of
    /// the concatenated contents with overlap stripped.
    pub fn validate_coverage(source: &str, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            if source.is_empty() {
                return Ok(());
            }
            return Err(EngineError::ChunkingFailed {
                reason: "no chunks produced for non-empty source".to_string(),
            });
        }

        let mut expected_start = 0;
        for chunk in chunks {
            if chunk.start_byte != expected_start {
                return Err(EngineError::ChunkingFailed {
                    reason: format!(
                        "chunk {} starts at byte {} but byte {} was expected",
                        chunk.index, chunk.start_byte, expected_start
                    ),
                });
            }
            if chunk.own_content() != &source[chunk.start_byte..chunk.end_byte] {
                return Err(EngineError::ChunkingFailed {
                    reason: format!("chunk {} content diverges from its byte range", chunk.index),
                });
            }
            expected_start = chunk.end_byte;
        }
        if expected_start != source.len() {
            return Err(EngineError::ChunkingFailed {
                reason: format!(
                    "chunks cover {expected_start} of {} source bytes",
                    source.len()
                ),
            });
        }
        Ok(())
    }

    /// Greedily pack consecutive boundary regions into chunks
    ///
    /// `starts` are the top-level block start bytes in source order. A
    /// region runs from one block's start to the next block's start, so a
    /// definition is never split. A single oversized region becomes its
    /// own chunk.
    fn pack_regions(&self, source: &str, line_starts: &[usize], starts: &[usize]) -> Vec<Chunk> {
        let mut cuts: Vec<usize> = Vec::with_capacity(starts.len() + 1);
        cuts.push(0);
        // The bytes before the first block attach to the first region
        cuts.extend(starts.iter().skip(1).copied());
        cuts.push(source.len());

        let mut chunks = Vec::new();
        let mut chunk_start = 0;
        let mut chunk_size = 0;

        for window in cuts.windows(2) {
            let region_size = window[1] - window[0];
            if chunk_size > 0
                && chunk_size + region_size > self.config.max_chunk_size
                && chunk_size >= self.config.min_chunk_size
            {
                chunks.push(make_chunk(
                    source,
                    line_starts,
                    chunk_start,
                    window[0],
                    chunks.len(),
                    ChunkBoundary::Syntactic,
                ));
                chunk_start = window[0];
                chunk_size = 0;
            }
            chunk_size += region_size;
        }
        if chunk_size > 0 {
            chunks.push(make_chunk(
                source,
                line_starts,
                chunk_start,
                source.len(),
                chunks.len(),
                ChunkBoundary::Syntactic,
            ));
        }
        chunks
    }

    /// Line-window fallback with backward natural-break search
    fn chunk_by_lines(&self, source: &str, line_starts: &[usize]) -> Vec<Chunk> {
        let lines: Vec<&str> = split_keep_newlines(source);
        let mut chunks = Vec::new();
        let mut first = 0;

        while first < lines.len() {
            let mut end = first;
            let mut size = 0;
            while end < lines.len()
                && end - first < self.config.max_lines_per_chunk
                && (size == 0 || size + lines[end].len() <= self.config.max_chunk_size)
            {
                size += lines[end].len();
                end += 1;
            }

            // Forced cut mid-document: prefer a natural break inside the window
            if end < lines.len() {
                if let Some(brk) = find_natural_break(&lines, first, end) {
                    end = brk;
                }
            }

            let start_byte = line_starts[first];
            let end_byte = if end < lines.len() {
                line_starts[end]
            } else {
                source.len()
            };
            chunks.push(make_chunk(
                source,
                line_starts,
                start_byte,
                end_byte,
                chunks.len(),
                ChunkBoundary::LineWindow,
            ));
            first = end;
        }
        chunks
    }
}

/// Single-pass chunk iterator with totals stamped
pub struct ChunkStream {
    inner: std::vec::IntoIter<Chunk>,
}

impl Iterator for ChunkStream {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ChunkStream {}

/// Byte offsets at which each line starts
pub(crate) fn line_starts(source: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (offset, byte) in source.bytes().enumerate() {
        if byte == b'\n' && offset + 1 < source.len() {
            starts.push(offset + 1);
        }
    }
    starts
}

/// Index of the line containing `byte`
pub(crate) fn line_index(line_starts: &[usize], byte: usize) -> usize {
    line_starts.partition_point(|&start| start <= byte).saturating_sub(1)
}

pub(crate) fn make_chunk(
    source: &str,
    line_starts: &[usize],
    start_byte: usize,
    end_byte: usize,
    index: usize,
    boundary: ChunkBoundary,
) -> Chunk {
    let start_line = line_index(line_starts, start_byte);
    let end_line = if end_byte > start_byte {
        line_index(line_starts, end_byte - 1) + 1
    } else {
        start_line
    };
    Chunk {
        content: source[start_byte..end_byte].to_string(),
        start_line,
        end_line,
        start_byte,
        end_byte,
        index,
        total_count: None,
        metadata: ChunkMetadata::plain(boundary),
    }
}

/// End byte of an adaptively sized chunk starting at `start`
///
/// The cut is aligned to the nearest preceding newline when one exists in
/// the window, and always lands on a char boundary.
pub(crate) fn adaptive_cut(source: &str, start: usize, target_size: usize) -> usize {
    let limit = (start + target_size.max(1)).min(source.len());
    if limit == source.len() {
        return limit;
    }

    let mut end = limit;
    while end > start && !source.is_char_boundary(end) {
        end -= 1;
    }
    if let Some(newline) = source[start..end].rfind('\n') {
        let aligned = start + newline + 1;
        if aligned > start {
            return aligned;
        }
    }
    if end > start {
        end
    } else {
        // A single oversized char: advance to the next boundary
        let mut forward = limit + 1;
        while forward < source.len() && !source.is_char_boundary(forward) {
            forward += 1;
        }
        forward
    }
}

fn split_keep_newlines(source: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (offset, byte) in source.bytes().enumerate() {
        if byte == b'\n' {
            lines.push(&source[start..=offset]);
            start = offset + 1;
        }
    }
    if start < source.len() {
        lines.push(&source[start..]);
    }
    lines
}

/// Search backward from the forced cut for a better line to cut before
///
/// A line qualifies when the previous line is blank, when it dedents, or
/// when it opens a new top-level construct. The search stops after half
/// the window to keep chunks from collapsing.
fn find_natural_break(lines: &[&str], first: usize, forced_end: usize) -> Option<usize> {
    let floor = first + (forced_end - first) / 2;
    (floor.max(first + 1)..forced_end)
        .rev()
        .find(|&candidate| is_natural_break(lines, candidate))
}

fn is_natural_break(lines: &[&str], candidate: usize) -> bool {
    if candidate == 0 {
        return false;
    }
    if lines[candidate - 1].trim().is_empty() {
        return true;
    }
    let line = lines[candidate];
    let trimmed = line.trim_start();
    if ["def ", "class ", "async def ", "import ", "from ", "@"]
        .iter()
        .any(|keyword| trimmed.starts_with(keyword))
    {
        return true;
    }
    indent_width(line) < indent_width(lines[candidate - 1])
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Prefix each chunk after the first with the previous chunk's tail lines
fn apply_overlap(source: &str, chunks: &mut [Chunk], overlap_lines: usize) {
    for index in 1..chunks.len() {
        let previous = &chunks[index - 1];
        let tail = trailing_lines(
            &source[previous.start_byte..previous.end_byte],
            overlap_lines,
        );
        if tail.is_empty() {
            continue;
        }
        let overlap_bytes = tail.len();
        let chunk = &mut chunks[index];
        chunk.content = format!("{tail}{}", &source[chunk.start_byte..chunk.end_byte]);
        chunk.metadata.has_overlap = true;
        chunk.metadata.overlap_bytes = overlap_bytes;
    }
}

/// Trailing window of `text` bounded by `max_bytes`
///
/// Aligned to a line start inside the window when possible, otherwise to
/// a char boundary.
pub(crate) fn context_tail(text: &str, max_bytes: usize) -> &str {
    if max_bytes == 0 {
        return "";
    }
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    if let Some(newline) = text[start..].find('\n') {
        let aligned = start + newline + 1;
        if aligned < text.len() {
            start = aligned;
        }
    }
    &text[start..]
}

/// Last `count` lines of `text`, newlines included
pub(crate) fn trailing_lines(text: &str, count: usize) -> &str {
    if count == 0 || text.is_empty() {
        return "";
    }
    let mut seen = 0;
    // Skip a trailing newline so it does not count as an empty final line
    let scan_end = text.len() - usize::from(text.ends_with('\n'));
    for (offset, byte) in text[..scan_end].bytes().enumerate().rev() {
        if byte == b'\n' {
            seen += 1;
            if seen == count {
                return &text[offset + 1..];
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use lintra_core::document::{Block, BlockKind, Document};
    use lintra_core::traits::{ParseError, Parsed};

    /// Parser that treats blank-line-separated paragraphs as function blocks
    struct ParagraphParser;

    impl Parser for ParagraphParser {
        fn parse(&self, source: &str, _filename: Option<&str>) -> std::result::Result<Parsed, ParseError> {
            if source.contains("!!syntax error!!") {
                return Err(ParseError::new("unexpected token"));
            }
            let line_starts = line_starts(source);
            let mut blocks = Vec::new();
            let mut start = 0;
            let mut offset = 0;
            for line in split_keep_newlines(source) {
                if line.trim().is_empty() && offset > start {
                    blocks.push(paragraph_block(source, &line_starts, start, offset));
                    start = offset + line.len();
                }
                offset += line.len();
            }
            if offset > start {
                blocks.push(paragraph_block(source, &line_starts, start, offset));
            }
            Ok(Parsed {
                document: Document::from_blocks(&blocks),
                warnings: Vec::new(),
            })
        }
    }

    fn paragraph_block(source: &str, starts: &[usize], from: usize, to: usize) -> Block {
        Block {
            kind: BlockKind::FunctionDef,
            content: source[from..to].to_string(),
            start_line: line_index(starts, from),
            end_line: line_index(starts, to.saturating_sub(1)) + 1,
            start_byte: from,
            end_byte: to,
        }
    }

    fn chunker(config: ChunkerConfig) -> DocumentChunker {
        DocumentChunker::new(config, Arc::new(ParagraphParser)).unwrap()
    }

    /// A synthetic function block of exactly `size` bytes, blank line included
    fn function_of(name: &str, size: usize) -> String {
        let header = format!("def {name}():\n");
        let body = "x".repeat(size - header.len() - "\n\n".len());
        format!("{header}{body}\n\n")
    }

    #[test]
    fn test_small_input_is_one_chunk() {
        let chunker = chunker(ChunkerConfig::default());
        let chunks = chunker.chunk("def f():\n    pass\n", None).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.boundary, ChunkBoundary::Whole);
        assert_eq!(chunks[0].start_line, 0);
        assert_eq!(chunks[0].end_line, 2);
    }

    #[test]
    fn test_three_functions_pack_two_then_one() {
        let source = format!(
            "{}{}{}",
            function_of("f1", 100),
            function_of("f2", 100),
            function_of("f3", 100)
        );
        let chunker = chunker(ChunkerConfig {
            max_chunk_size: 250,
            min_chunk_size: 1,
            ..Default::default()
        });

        let chunks = chunker.chunk(&source, None).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].end_byte, 200);
        assert!(chunks[0].content.contains("def f1"));
        assert!(chunks[0].content.contains("def f2"));
        assert!(chunks[1].content.contains("def f3"));
        DocumentChunker::validate_coverage(&source, &chunks).unwrap();
    }

    #[test]
    fn test_oversized_definition_gets_its_own_chunk() {
        let source = format!(
            "{}{}{}",
            function_of("f1", 100),
            function_of("big", 600),
            function_of("f2", 100)
        );
        let chunker = chunker(ChunkerConfig {
            max_chunk_size: 250,
            min_chunk_size: 1,
            ..Default::default()
        });

        let chunks = chunker.chunk(&source, None).unwrap();
        assert!(chunks.iter().any(|chunk| chunk.len() == 600));
        // The oversized function stays whole
        let big = chunks
            .iter()
            .find(|chunk| chunk.content.contains("def big"))
            .unwrap();
        assert!(big.content.ends_with("\n\n"));
        DocumentChunker::validate_coverage(&source, &chunks).unwrap();
    }

    #[test]
    fn test_parse_failure_falls_back_to_line_windows() {
        let mut source = String::from("!!syntax error!!\n");
        for index in 0..200 {
            source.push_str(&format!("line number {index}\n"));
        }
        let chunker = chunker(ChunkerConfig {
            max_chunk_size: 500,
            min_chunk_size: 1,
            ..Default::default()
        });

        let chunks = chunker.chunk(&source, None).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks
            .iter()
            .all(|chunk| chunk.metadata.boundary == ChunkBoundary::LineWindow));
        DocumentChunker::validate_coverage(&source, &chunks).unwrap();
    }

    #[test]
    fn test_forced_cut_prefers_blank_line_break() {
        // One long paragraph, then a blank line, then a second paragraph
        // that straddles the forced cut.
        let mut source = String::new();
        for _ in 0..20 {
            source.push_str("aaaaaaaaaaaaaaaaaaaa\n");
        }
        source.push('\n');
        for _ in 0..20 {
            source.push_str("bbbbbbbbbbbbbbbbbbbb\n");
        }
        let chunker = chunker(ChunkerConfig {
            max_chunk_size: 600,
            min_chunk_size: 1,
            respect_boundaries: false,
            ..Default::default()
        });

        let chunks = chunker.chunk(&source, None).unwrap();
        // The second chunk starts right after the blank line
        assert!(chunks[1].content.starts_with('b'));
        DocumentChunker::validate_coverage(&source, &chunks).unwrap();
    }

    #[test]
    fn test_overlap_is_stripped_for_coverage() {
        let source = format!(
            "{}{}{}",
            function_of("f1", 150),
            function_of("f2", 150),
            function_of("f3", 150)
        );
        let chunker = chunker(ChunkerConfig {
            max_chunk_size: 200,
            min_chunk_size: 1,
            overlap_lines: 2,
            ..Default::default()
        });

        let chunks = chunker.chunk(&source, None).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks[1].metadata.has_overlap);
        assert!(chunks[1].metadata.overlap_bytes > 0);
        assert!(chunks[1].len() > chunks[1].own_content().len());
        DocumentChunker::validate_coverage(&source, &chunks).unwrap();
    }

    #[test]
    fn test_stream_stamps_totals() {
        let source = format!("{}{}", function_of("f1", 200), function_of("f2", 200));
        let chunker = chunker(ChunkerConfig {
            max_chunk_size: 250,
            min_chunk_size: 1,
            ..Default::default()
        });

        let chunks: Vec<Chunk> = chunker.stream(&source, None).unwrap().collect();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| chunk.total_count == Some(2)));
        assert_eq!(
            chunks.iter().map(|chunk| chunk.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_validate_coverage_detects_gaps() {
        let source = "abc\ndef\n";
        let starts = line_starts(source);
        let chunks = vec![
            make_chunk(source, &starts, 0, 4, 0, ChunkBoundary::Syntactic),
            // Gap: second chunk starts late
            make_chunk(source, &starts, 5, 8, 1, ChunkBoundary::Syntactic),
        ];
        assert!(DocumentChunker::validate_coverage(source, &chunks).is_err());
    }

    #[test]
    fn test_adaptive_cut_aligns_to_newline() {
        let source = "first line\nsecond line\nthird line\n";
        let cut = adaptive_cut(source, 0, 15);
        assert_eq!(&source[..cut], "first line\n");

        // No newline in the window: cut at the size limit
        let cut = adaptive_cut("abcdefghij", 0, 4);
        assert_eq!(cut, 4);

        // Window reaching the end takes everything
        let cut = adaptive_cut(source, 23, 1000);
        assert_eq!(cut, source.len());
    }

    #[test]
    fn test_adaptive_cut_respects_char_boundaries() {
        let source = "日本語のテキスト";
        let cut = adaptive_cut(source, 0, 4);
        assert!(source.is_char_boundary(cut));
        assert!(cut > 0);
    }

    #[test]
    fn test_context_tail_aligns_to_line_start() {
        let text = "first line\nsecond line\nthird line\n";
        assert_eq!(context_tail(text, 15), "third line\n");
        assert_eq!(context_tail(text, text.len()), text);
        assert_eq!(context_tail(text, 0), "");
        // No full line in the window: fall back to the byte window
        assert_eq!(context_tail("abcdefgh", 3), "fgh");
    }

    #[test]
    fn test_trailing_lines() {
        assert_eq!(trailing_lines("a\nb\nc\n", 1), "c\n");
        assert_eq!(trailing_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(trailing_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(trailing_lines("abc", 5), "abc");
        assert_eq!(trailing_lines("a\n", 0), "");
    }
}
