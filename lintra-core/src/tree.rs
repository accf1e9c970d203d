//! Tagged node tree representation of parsed documents
//!
//! Parsed documents are cached and persisted as a data-only recursive
//! structure: a node-type tag, an ordered field map, and source position
//! attributes. Loading never executes code; the loader matches on the tag
//! and bounds recursion depth, emitting an explicit truncation marker when
//! the bound is hit.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Maximum nesting depth accepted when loading a persisted tree
pub const MAX_TREE_DEPTH: usize = 64;

/// Source position attributes for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    /// First line covered by the node (0-based)
    pub start_line: usize,
    /// Line one past the last covered line
    pub end_line: usize,
    /// First byte covered by the node
    pub start_byte: usize,
    /// Byte one past the last covered byte
    pub end_byte: usize,
}

impl Span {
    /// Create a span from line and byte ranges
    pub fn new(start_line: usize, end_line: usize, start_byte: usize, end_byte: usize) -> Self {
        Self {
            start_line,
            end_line,
            start_byte,
            end_byte,
        }
    }

    /// Byte length covered by the span
    pub fn byte_len(&self) -> usize {
        self.end_byte.saturating_sub(self.start_byte)
    }
}

/// A single tree node: type tag, ordered field map, position attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Node type tag (e.g. `"module"`, `"function_def"`)
    pub tag: String,
    /// Named fields in deterministic order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldValue>,
    /// Source position, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

/// Closed set of data-only field variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Text payload
    Text(String),
    /// Numeric payload
    Number(f64),
    /// Boolean payload
    Flag(bool),
    /// Single child node
    Node(Box<TreeNode>),
    /// Ordered child node list
    Nodes(Vec<TreeNode>),
    /// Marker left where loading hit the depth bound
    Truncated,
}

impl TreeNode {
    /// Create a node with no fields or span
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            fields: BTreeMap::new(),
            span: None,
        }
    }

    /// Attach a span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Insert a field, returning self for chaining
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Text payload of a field, if present and textual
    pub fn text_field(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Child list of a field, if present and a node list
    pub fn nodes_field(&self, name: &str) -> Option<&[TreeNode]> {
        match self.fields.get(name) {
            Some(FieldValue::Nodes(nodes)) => Some(nodes),
            _ => None,
        }
    }

    /// Total node count of the tree rooted here, including this node
    pub fn node_count(&self) -> usize {
        let mut count = 1;
        for value in self.fields.values() {
            match value {
                FieldValue::Node(node) => count += node.node_count(),
                FieldValue::Nodes(nodes) => {
                    count += nodes.iter().map(TreeNode::node_count).sum::<usize>()
                }
                _ => {}
            }
        }
        count
    }

    /// Load a tree from a JSON value with bounded recursion depth
    ///
    /// Unknown shapes are rejected; nesting beyond [`MAX_TREE_DEPTH`] is
    /// replaced with [`FieldValue::Truncated`] rather than recursed into.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::from_value_bounded(value, 0)
    }

    fn from_value_bounded(value: &Value, depth: usize) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| CoreError::MalformedEntry {
            reason: "node is not an object".to_string(),
        })?;

        let tag = object
            .get("tag")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedEntry {
                reason: "node has no string tag".to_string(),
            })?
            .to_string();

        let span = match object.get("span") {
            Some(raw) => Some(serde_json::from_value(raw.clone())?),
            None => None,
        };

        let mut fields = BTreeMap::new();
        if let Some(raw_fields) = object.get("fields") {
            let map = raw_fields
                .as_object()
                .ok_or_else(|| CoreError::MalformedEntry {
                    reason: format!("fields of `{tag}` is not an object"),
                })?;
            for (name, raw) in map {
                fields.insert(name.clone(), FieldValue::from_value_bounded(raw, depth)?);
            }
        }

        Ok(Self { tag, fields, span })
    }
}

impl FieldValue {
    fn from_value_bounded(value: &Value, depth: usize) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| CoreError::MalformedEntry {
            reason: "field value is not an object".to_string(),
        })?;
        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedEntry {
                reason: "field value has no kind".to_string(),
            })?;
        let payload = object.get("value");

        match kind {
            "text" => match payload.and_then(Value::as_str) {
                Some(text) => Ok(FieldValue::Text(text.to_string())),
                None => Err(CoreError::MalformedEntry {
                    reason: "text field without string value".to_string(),
                }),
            },
            "number" => match payload.and_then(Value::as_f64) {
                Some(number) => Ok(FieldValue::Number(number)),
                None => Err(CoreError::MalformedEntry {
                    reason: "number field without numeric value".to_string(),
                }),
            },
            "flag" => match payload.and_then(Value::as_bool) {
                Some(flag) => Ok(FieldValue::Flag(flag)),
                None => Err(CoreError::MalformedEntry {
                    reason: "flag field without boolean value".to_string(),
                }),
            },
            "node" => {
                if depth + 1 >= MAX_TREE_DEPTH {
                    return Ok(FieldValue::Truncated);
                }
                let raw = payload.ok_or_else(|| CoreError::MalformedEntry {
                    reason: "node field without value".to_string(),
                })?;
                Ok(FieldValue::Node(Box::new(TreeNode::from_value_bounded(
                    raw,
                    depth + 1,
                )?)))
            }
            "nodes" => {
                if depth + 1 >= MAX_TREE_DEPTH {
                    return Ok(FieldValue::Truncated);
                }
                let raw = payload.and_then(Value::as_array).ok_or_else(|| {
                    CoreError::MalformedEntry {
                        reason: "nodes field without array value".to_string(),
                    }
                })?;
                let nodes = raw
                    .iter()
                    .map(|item| TreeNode::from_value_bounded(item, depth + 1))
                    .collect::<Result<Vec<_>>>()?;
                Ok(FieldValue::Nodes(nodes))
            }
            "truncated" => Ok(FieldValue::Truncated),
            other => Err(CoreError::MalformedEntry {
                reason: format!("unknown field kind `{other}`"),
            }),
        }
    }
}
