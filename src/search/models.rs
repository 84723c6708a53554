//! Search request and response types

use crate::explorer::{ExploreOptions, Exploration};
use crate::neo4j::models::{EmbeddingField, GraphNode, NodeFilter};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Lexical,
    Semantic,
    #[default]
    Hybrid,
}

impl SearchMode {
    /// Whether the mode needs query and node embeddings
    pub fn needs_vectors(&self) -> bool {
        matches!(self, Self::Semantic | Self::Hybrid)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    /// Defaults to the configured limit
    pub limit: Option<usize>,
    #[serde(default)]
    pub filter: NodeFilter,
    /// Edit distance tolerated per token, 0 to 2. Defaults to the configured value.
    pub fuzzy_distance: Option<u8>,
    /// Treat `query` as a regular expression (lexical matching only)
    #[serde(default)]
    pub regex: bool,
    /// Lines of context around a content match
    #[serde(default)]
    pub context_lines: usize,
    #[serde(default)]
    pub embedding_field: EmbeddingField,
    /// Drop results scoring below this. Semantic and hybrid searches fall back
    /// to the configured default on the vector scores.
    pub min_score: Option<f64>,
    /// Keywords whose fuzzy presence in name, path, title or signature
    /// boosts a result
    #[serde(default)]
    pub boost_keywords: Vec<String>,
    /// Wait for queued edits and running batches before reading
    #[serde(default = "default_true")]
    pub wait_for_edits: bool,
    /// Attach relationship context to every result
    pub explore: Option<ExploreOptions>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: SearchMode::default(),
            limit: None,
            filter: NodeFilter::default(),
            fuzzy_distance: None,
            regex: false,
            context_lines: 0,
            embedding_field: EmbeddingField::default(),
            min_score: None,
            boost_keywords: Vec::new(),
            wait_for_edits: true,
            explore: None,
        }
    }

    pub fn mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn fuzzy(mut self, distance: u8) -> Self {
        self.fuzzy_distance = Some(distance);
        self
    }

    pub fn regex(mut self) -> Self {
        self.regex = true;
        self
    }

    pub fn context_lines(mut self, lines: usize) -> Self {
        self.context_lines = lines;
        self
    }

    pub fn embedding_field(mut self, field: EmbeddingField) -> Self {
        self.embedding_field = field;
        self
    }

    pub fn min_score(mut self, score: f64) -> Self {
        self.min_score = Some(score);
        self
    }

    pub fn boost<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.boost_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.wait_for_edits = false;
        self
    }

    pub fn explore(mut self, options: ExploreOptions) -> Self {
        self.explore = Some(options);
        self
    }
}

/// Lines of a node's content around a match, 1-based inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRange {
    pub start_line: u64,
    pub end_line: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matched node, without embedding vectors
    pub node: GraphNode,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_range: Option<MatchedRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Exploration>,
}

impl SearchResult {
    pub fn new(node: GraphNode, score: f64) -> Self {
        Self {
            node,
            score,
            matched_range: None,
            context: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Matches before the limit was applied
    pub total_count: usize,
    pub searched_projects: Vec<String>,
    pub mode: SearchMode,
    /// The search had to wait for pending edits or embeddings
    pub waited_for_edits: bool,
    /// A wait timed out; results may not reflect the latest edits
    pub possibly_stale: bool,
    pub keyword_boosted: bool,
}

/// Sort best first; ties broken by uuid for stable output.
pub(crate) fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.node.uuid.cmp(&b.node.uuid))
    });
}
