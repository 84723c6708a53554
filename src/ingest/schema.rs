//! Schema registry for derived nodes
//!
//! Every node is a `NodeKind` tag plus an open property map. Adapters may
//! produce any label; known kinds are checked for their required properties
//! when a file is ingested, so read paths can rely on them.

use crate::error::CoreError;
use crate::neo4j::models::{props, GraphNode, SOURCE_FILE_LABEL};
use std::collections::HashMap;

/// Known node kinds. Unknown labels map to `Other` and only get the generic
/// checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Module,
    Function,
    Method,
    Class,
    Interface,
    Variable,
    Document,
    Section,
    Media,
    WebPage,
    Other(String),
}

impl NodeKind {
    pub fn from_label(label: &str) -> Self {
        match label {
            "File" => Self::File,
            "Module" => Self::Module,
            "Function" => Self::Function,
            "Method" => Self::Method,
            "Class" => Self::Class,
            "Interface" => Self::Interface,
            "Variable" => Self::Variable,
            "Document" => Self::Document,
            "Section" => Self::Section,
            "Media" => Self::Media,
            "WebPage" => Self::WebPage,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::File => "File",
            Self::Module => "Module",
            Self::Function => "Function",
            Self::Method => "Method",
            Self::Class => "Class",
            Self::Interface => "Interface",
            Self::Variable => "Variable",
            Self::Document => "Document",
            Self::Section => "Section",
            Self::Media => "Media",
            Self::WebPage => "WebPage",
            Self::Other(label) => label,
        }
    }

    /// Properties a node of this kind must carry (non-empty strings).
    pub fn required_properties(&self) -> &'static [&'static str] {
        match self {
            Self::File | Self::Media => &[props::FILE_PATH],
            Self::Module
            | Self::Function
            | Self::Method
            | Self::Class
            | Self::Interface
            | Self::Variable => &[props::NAME],
            Self::Document => &[props::TITLE],
            Self::Section => &[props::CONTENT],
            Self::WebPage => &["url"],
            Self::Other(_) => &[],
        }
    }
}

/// Validates nodes against their kind. Extra requirements can be registered
/// per label, e.g. by a format-specific adapter.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    extra: HashMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require additional properties on nodes with `label`.
    pub fn register(&mut self, label: impl Into<String>, required: &[&str]) {
        self.extra
            .entry(label.into())
            .or_default()
            .extend(required.iter().map(|s| s.to_string()));
    }

    pub fn validate(&self, node: &GraphNode) -> Result<NodeKind, CoreError> {
        let violation = |message: String| CoreError::SchemaViolation {
            label: node.label.clone(),
            message,
        };

        let label_ok = !node.label.is_empty()
            && node.label.starts_with(|c: char| c.is_ascii_alphabetic())
            && node
                .label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !label_ok {
            return Err(violation("label must be an alphanumeric identifier".into()));
        }
        if node.label == SOURCE_FILE_LABEL {
            return Err(violation(format!(
                "{} is reserved for file records",
                SOURCE_FILE_LABEL
            )));
        }
        if node.project_id.is_empty() {
            return Err(violation("missing project id".into()));
        }

        let kind = NodeKind::from_label(&node.label);
        let extra = self
            .extra
            .get(&node.label)
            .map(|v| v.iter().map(String::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        for key in kind.required_properties().iter().copied().chain(extra) {
            let present = node
                .properties
                .get(key)
                .is_some_and(|v| v.as_str().map_or(!v.is_null(), |s| !s.trim().is_empty()));
            if !present {
                return Err(violation(format!("missing required property '{}'", key)));
            }
        }

        match (node.start_line(), node.end_line()) {
            (Some(start), Some(end)) if start > end => {
                return Err(violation(format!(
                    "start_line {} is after end_line {}",
                    start, end
                )));
            }
            _ => {}
        }
        for key in [props::START_LINE, props::END_LINE] {
            if let Some(v) = node.properties.get(key) {
                if !v.is_u64() {
                    return Err(violation(format!("'{}' must be a line number", key)));
                }
            }
        }

        Ok(kind)
    }
}
