//! Property: any chunk split reconstructs the source byte-for-byte

use lintra_core::document::{Block, BlockKind, Document};
use lintra_core::traits::{ParseError, Parsed, Parser};
use lintra_engine::chunker::ChunkerConfig;
use lintra_engine::DocumentChunker;
use proptest::prelude::*;
use std::sync::Arc;

/// Paragraph parser: blank-line-separated runs become blocks whose start
/// bytes partition the source.
struct ParagraphParser;

impl Parser for ParagraphParser {
    fn parse(&self, source: &str, _filename: Option<&str>) -> Result<Parsed, ParseError> {
        let mut blocks = Vec::new();
        let mut start = 0;
        let mut offset = 0;
        let mut previous_blank = true;
        for line in source.split_inclusive('\n') {
            let blank = line.trim().is_empty();
            if !blank && previous_blank && offset > start {
                blocks.push(block(source, start, offset));
                start = offset;
            }
            previous_blank = blank;
            offset += line.len();
        }
        if offset > start {
            blocks.push(block(source, start, offset));
        }
        Ok(Parsed {
            document: Document::from_blocks(&blocks),
            warnings: Vec::new(),
        })
    }
}

fn block(source: &str, start: usize, end: usize) -> Block {
    Block {
        kind: BlockKind::Code,
        content: source[start..end].to_string(),
        start_line: 0,
        end_line: 0,
        start_byte: start,
        end_byte: end,
    }
}

fn paragraph_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec("[a-z ]{0,40}", 1..8)
        .prop_map(|lines| format!("{}\n", lines.join("\n")))
}

fn document_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(paragraph_strategy(), 1..20)
        .prop_map(|paragraphs| paragraphs.join("\n"))
}

proptest! {
    #[test]
    fn chunks_reconstruct_source(
        source in document_strategy(),
        max_chunk_size in 40usize..400,
        overlap_lines in 0usize..4,
        respect_boundaries in any::<bool>(),
    ) {
        let chunker = DocumentChunker::new(
            ChunkerConfig {
                max_chunk_size,
                min_chunk_size: 1,
                max_lines_per_chunk: 50,
                overlap_lines,
                respect_boundaries,
            },
            Arc::new(ParagraphParser),
        )
        .unwrap();

        let chunks = chunker.chunk(&source, None).unwrap();
        DocumentChunker::validate_coverage(&source, &chunks).unwrap();

        let rebuilt: String = chunks.iter().map(|chunk| chunk.own_content()).collect();
        prop_assert_eq!(rebuilt, source);

        for pair in chunks.windows(2) {
            prop_assert!(pair[0].index + 1 == pair[1].index);
            prop_assert!(pair[0].end_byte == pair[1].start_byte);
        }
    }
}
