//! Parsed document model and top-level block projection

use crate::tree::{FieldValue, Span, TreeNode};
use serde::{Deserialize, Serialize};

/// Classification of a top-level block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Function definition, including decorators and leading comments
    FunctionDef,
    /// Class definition, including decorators and leading comments
    ClassDef,
    /// Import statement
    Import,
    /// Module docstring
    Docstring,
    /// Standalone comment
    Comment,
    /// Natural-language prose to be translated
    NaturalLanguage,
    /// Any other code statement
    Code,
}

impl BlockKind {
    /// Map a node tag to a block kind
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "function_def" | "async_function_def" => BlockKind::FunctionDef,
            "class_def" => BlockKind::ClassDef,
            "import" | "import_from" => BlockKind::Import,
            "docstring" => BlockKind::Docstring,
            "comment" => BlockKind::Comment,
            "natural_language" | "prose" => BlockKind::NaturalLanguage,
            _ => BlockKind::Code,
        }
    }

    /// True for blocks that go through the translation manager
    pub fn is_natural_language(&self) -> bool {
        matches!(self, BlockKind::NaturalLanguage)
    }

    /// True for definitions that must never be split across chunks
    pub fn is_definition(&self) -> bool {
        matches!(self, BlockKind::FunctionDef | BlockKind::ClassDef)
    }
}

/// A top-level block of a parsed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block classification
    pub kind: BlockKind,
    /// Source text of the block
    pub content: String,
    /// First line (0-based)
    pub start_line: usize,
    /// Line one past the last line
    pub end_line: usize,
    /// First byte offset in the source
    pub start_byte: usize,
    /// Byte offset one past the block
    pub end_byte: usize,
}

impl Block {
    /// Byte length of the block's source region
    pub fn byte_len(&self) -> usize {
        self.end_byte.saturating_sub(self.start_byte)
    }
}

/// A parsed document, owned as a tagged node tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Root node; top-level blocks are its `children` field
    pub root: TreeNode,
}

impl Document {
    /// Wrap a root node
    pub fn new(root: TreeNode) -> Self {
        Self { root }
    }

    /// Total number of nodes in the tree
    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Project the root's children into ordered top-level blocks
    ///
    /// Children without a span or text field are skipped; block order
    /// follows child order.
    pub fn top_level_blocks(&self) -> Vec<Block> {
        let Some(children) = self.root.nodes_field("children") else {
            return Vec::new();
        };

        children
            .iter()
            .filter_map(|node| {
                let span = node.span?;
                let content = node.text_field("text")?.to_string();
                Some(Block {
                    kind: BlockKind::from_tag(&node.tag),
                    content,
                    start_line: span.start_line,
                    end_line: span.end_line,
                    start_byte: span.start_byte,
                    end_byte: span.end_byte,
                })
            })
            .collect()
    }

    /// Build a document from ready-made blocks
    ///
    /// Used by parsers that produce a flat block list rather than a full
    /// tree; each block becomes one child node.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        let children = blocks
            .iter()
            .map(|block| {
                TreeNode::new(tag_for_kind(block.kind))
                    .with_span(Span::new(
                        block.start_line,
                        block.end_line,
                        block.start_byte,
                        block.end_byte,
                    ))
                    .with_field("text", FieldValue::Text(block.content.clone()))
            })
            .collect();
        Self {
            root: TreeNode::new("module").with_field("children", FieldValue::Nodes(children)),
        }
    }
}

fn tag_for_kind(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::FunctionDef => "function_def",
        BlockKind::ClassDef => "class_def",
        BlockKind::Import => "import",
        BlockKind::Docstring => "docstring",
        BlockKind::Comment => "comment",
        BlockKind::NaturalLanguage => "natural_language",
        BlockKind::Code => "statement",
    }
}
