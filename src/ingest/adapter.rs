//! Source adapters
//!
//! A `SourceAdapter` turns raw file content into graph fragments. Format
//! specific extraction (code ASTs, OCR, media metadata, crawling) plugs in
//! here; the crate ships a generic `TextBlockAdapter` that splits text into
//! blank-line separated sections.

use crate::neo4j::models::{props, Properties};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Input handed to an adapter for one file.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions<'a> {
    pub project_id: &'a str,
    /// Path relative to the project root, `/`-separated
    pub path: &'a str,
    pub content: &'a [u8],
}

/// A node produced by an adapter, before it gets a uuid.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNode {
    pub label: String,
    /// Unique per label within the file; stable across edits that do not
    /// change what the node is (e.g. a qualified name, not a line number).
    pub key: String,
    pub properties: Properties,
}

impl ParsedNode {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Endpoint of a parsed relationship.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// A node of the same parse result, by `(label, key)`
    Local { label: String, key: String },
    /// A node owned by another file, already resolved
    External(Uuid),
}

impl NodeRef {
    pub fn local(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Local {
            label: label.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRelationship {
    pub from: NodeRef,
    pub to: NodeRef,
    pub rel_type: String,
    pub properties: Properties,
}

impl ParsedRelationship {
    pub fn new(from: NodeRef, to: NodeRef, rel_type: impl Into<String>) -> Self {
        Self {
            from,
            to,
            rel_type: rel_type.into(),
            properties: Properties::new(),
        }
    }
}

/// Everything an adapter extracted from one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFragment {
    pub nodes: Vec<ParsedNode>,
    pub relationships: Vec<ParsedRelationship>,
}

/// Turns raw content into graph fragments.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Adapter name, for logs
    fn name(&self) -> &str;

    /// Whether this adapter handles the given path
    fn supports(&self, path: &Path) -> bool;

    /// Extract nodes and relationships. Must be a pure function of the
    /// options: the same content always yields the same fragment.
    async fn parse(&self, options: ParseOptions<'_>) -> Result<ParsedFragment>;
}

/// Ordered list of adapters; the first one that supports a path wins.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the generic text adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TextBlockAdapter::default()));
        registry
    }

    /// Add an adapter. Adapters registered earlier take precedence.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.supports(path)).cloned()
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.adapters.iter().any(|a| a.supports(path))
    }
}

// ============================================================================
// Text block adapter
// ============================================================================

/// Default extensions handled by [`TextBlockAdapter`]
const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "rst", "adoc", "org", "rs", "py", "ts", "tsx", "js", "jsx", "go",
    "java", "kt", "rb", "c", "h", "cpp", "hpp", "toml", "yaml", "yml", "json", "sh",
];

/// Longest `name` derived from a section's first line
const MAX_NAME_CHARS: usize = 80;

/// Splits text files into a `Document` node and one `Section` node per
/// blank-line separated block.
///
/// Sections are keyed by ordinal, so editing text inside a block changes only
/// that section's node.
pub struct TextBlockAdapter {
    extensions: Vec<String>,
}

impl Default for TextBlockAdapter {
    fn default() -> Self {
        Self::new(TEXT_EXTENSIONS)
    }
}

impl TextBlockAdapter {
    pub fn new(extensions: &[&str]) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    /// Split text into `(start_line, end_line, text)` blocks, 1-based
    /// inclusive line numbers.
    pub fn split_blocks(text: &str) -> Vec<(usize, usize, String)> {
        let mut blocks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut start = 0;

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    blocks.push((start, idx, current.join("\n")));
                    current.clear();
                }
            } else {
                if current.is_empty() {
                    start = idx + 1;
                }
                current.push(line);
            }
        }
        if !current.is_empty() {
            let end = start + current.len() - 1;
            blocks.push((start, end, current.join("\n")));
        }
        blocks
    }

    fn section_name(block: &str) -> String {
        let first = block
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .trim_start_matches('#')
            .trim();
        first.chars().take(MAX_NAME_CHARS).collect()
    }
}

#[async_trait]
impl SourceAdapter for TextBlockAdapter {
    fn name(&self) -> &str {
        "text-block"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_lowercase()))
    }

    async fn parse(&self, options: ParseOptions<'_>) -> Result<ParsedFragment> {
        let text = std::str::from_utf8(options.content)
            .with_context(|| format!("{} is not valid UTF-8", options.path))?;

        let title = Path::new(options.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| options.path.to_string());

        let blocks = Self::split_blocks(text);
        let mut fragment = ParsedFragment::default();
        fragment.nodes.push(
            ParsedNode::new("Document", "document")
                .with_property(props::TITLE, title.clone())
                .with_property(props::NAME, title),
        );

        let document = NodeRef::local("Document", "document");
        let mut previous: Option<NodeRef> = None;
        for (ordinal, (start, end, block)) in blocks.into_iter().enumerate() {
            let key = format!("section:{}", ordinal);
            fragment.nodes.push(
                ParsedNode::new("Section", key.clone())
                    .with_property(props::NAME, Self::section_name(&block))
                    .with_property(props::CONTENT, block)
                    .with_property(props::START_LINE, start as u64)
                    .with_property(props::END_LINE, end as u64)
                    .with_property("ordinal", ordinal as u64),
            );
            let section = NodeRef::local("Section", key);
            fragment.relationships.push(ParsedRelationship::new(
                document.clone(),
                section.clone(),
                "CONTAINS",
            ));
            if let Some(prev) = previous.take() {
                fragment
                    .relationships
                    .push(ParsedRelationship::new(prev, section.clone(), "NEXT"));
            }
            previous = Some(section);
        }

        Ok(fragment)
    }
}
