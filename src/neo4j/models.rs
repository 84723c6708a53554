//! Models for the knowledge graph
//!
//! Nodes carry a fixed identity (`uuid`, `label`, `project_id`) plus an open
//! property map. File lifecycle records live on `SourceFile` nodes in the same
//! graph, so there is no separate on-disk index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Open property map. `BTreeMap` keeps key order stable, which the node
/// content hash relies on.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Property names shared by the store, the ingestion pipeline and search.
pub mod props {
    pub const UUID: &str = "uuid";
    pub const PROJECT_ID: &str = "project_id";
    pub const FILE_PATH: &str = "file_path";
    pub const NAME: &str = "name";
    pub const TITLE: &str = "title";
    pub const SIGNATURE: &str = "signature";
    pub const CONTENT: &str = "content";
    pub const DESCRIPTION: &str = "description";
    pub const CONTENT_HASH: &str = "content_hash";
    pub const START_LINE: &str = "start_line";
    pub const END_LINE: &str = "end_line";
    pub const SCHEMA_DIRTY: &str = "schema_dirty";
    pub const EMBEDDINGS_DIRTY: &str = "embeddings_dirty";
    pub const SOURCE_FILE: &str = "source_file";

    /// Fields lexical search reads
    pub const TEXT_FIELDS: &[&str] = &[NAME, TITLE, SIGNATURE, FILE_PATH, DESCRIPTION, CONTENT];
}

/// Label of the per-file record node.
pub const SOURCE_FILE_LABEL: &str = "SourceFile";

/// Relationship linking every derived node to its `SourceFile` node.
pub const DEFINED_IN: &str = "DEFINED_IN";

// ============================================================================
// Nodes and relationships
// ============================================================================

/// A node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub uuid: Uuid,
    pub label: String,
    pub project_id: String,
    #[serde(default)]
    pub properties: Properties,
}

impl GraphNode {
    pub fn new(uuid: Uuid, label: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            uuid,
            label: label.into(),
            project_id: project_id.into(),
            properties: Properties::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// String property, if present and a string.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.text(props::NAME)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.text(props::FILE_PATH)
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.text(props::CONTENT_HASH)
    }

    pub fn start_line(&self) -> Option<u64> {
        self.properties.get(props::START_LINE).and_then(|v| v.as_u64())
    }

    pub fn end_line(&self) -> Option<u64> {
        self.properties.get(props::END_LINE).and_then(|v| v.as_u64())
    }

    fn flag(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn embeddings_dirty(&self) -> bool {
        self.flag(props::EMBEDDINGS_DIRTY)
    }

    pub fn schema_dirty(&self) -> bool {
        self.flag(props::SCHEMA_DIRTY)
    }

    /// Stored embedding vector for a concrete field.
    pub fn embedding(&self, field: EmbeddingField) -> Option<Vec<f32>> {
        let arr = self.properties.get(field.property_name()?)?.as_array()?;
        arr.iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
    }

    /// Whether some lowercased text field contains one of `terms`. An empty
    /// term list matches every node.
    pub fn contains_any_term(&self, terms: &[String]) -> bool {
        if terms.is_empty() {
            return true;
        }
        props::TEXT_FIELDS.iter().any(|field| {
            self.text(field).is_some_and(|text| {
                let lower = text.to_lowercase();
                terms.iter().any(|t| lower.contains(t.as_str()))
            })
        })
    }

    /// Drop stored vectors and embedding metadata before handing the node out.
    pub fn strip_embeddings(&mut self) {
        self.properties
            .retain(|key, _| !key.starts_with("embedding_") && key != "embedded_at");
    }
}

/// Merge key of a relationship: at most one edge per (from, to, type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub from: Uuid,
    pub to: Uuid,
    pub rel_type: String,
}

/// A typed, directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from: Uuid,
    pub to: Uuid,
    pub rel_type: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Relationship {
    pub fn new(from: Uuid, to: Uuid, rel_type: impl Into<String>) -> Self {
        Self {
            from,
            to,
            rel_type: rel_type.into(),
            properties: Properties::new(),
        }
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            from: self.from,
            to: self.to,
            rel_type: self.rel_type.clone(),
        }
    }

    /// The key as a single string, stored on the edge so owned edges that are
    /// no longer produced can be found and removed.
    pub fn key_string(&self) -> String {
        format!("{}|{}|{}", self.from, self.rel_type, self.to)
    }
}

/// Minimal view of a stored node used by the diff engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNodeDigest {
    pub uuid: Uuid,
    pub label: String,
    pub content_hash: Option<String>,
}

// ============================================================================
// File lifecycle
// ============================================================================

/// Lifecycle state of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Discovered,
    Queued,
    Parsing,
    Parsed,
    EmbeddingPending,
    Embedded,
    Error,
    Deleted,
}

impl FileState {
    pub const ALL: [FileState; 8] = [
        FileState::Discovered,
        FileState::Queued,
        FileState::Parsing,
        FileState::Parsed,
        FileState::EmbeddingPending,
        FileState::Embedded,
        FileState::Error,
        FileState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Queued => "queued",
            Self::Parsing => "parsing",
            Self::Parsed => "parsed",
            Self::EmbeddingPending => "embedding_pending",
            Self::Embedded => "embedded",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    /// `embedded` and `deleted` end a lifecycle run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Embedded | Self::Deleted)
    }

    /// States owned by an in-flight ingestion. A file sitting in one of these
    /// past the recovery threshold was abandoned by a crashed worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Parsing | Self::Parsed)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown file state: {}", s))
    }
}

/// Per-file record: content hash and lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub project_id: String,
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub content_hash: Option<String>,
    pub state: FileState,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    /// Orphaned node uuids whose deletion failed and must be retried.
    #[serde(default)]
    pub pending_orphans: Vec<Uuid>,
}

impl FileRecord {
    /// A freshly discovered file with no stored content.
    pub fn discovered(project_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            path: path.into(),
            content_hash: None,
            state: FileState::Discovered,
            last_error: None,
            retry_count: 0,
            last_processed_at: None,
            state_changed_at: Utc::now(),
            pending_orphans: Vec::new(),
        }
    }
}

// ============================================================================
// Projects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectType {
    TrackedProject,
    QuickIngest,
    OrphanFile,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrackedProject => "tracked-project",
            Self::QuickIngest => "quick-ingest",
            Self::OrphanFile => "orphan-file",
        }
    }
}

impl FromStr for ProjectType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tracked-project" => Ok(Self::TrackedProject),
            "quick-ingest" => Ok(Self::QuickIngest),
            "orphan-file" => Ok(Self::OrphanFile),
            other => anyhow::bail!("unknown project type: {}", other),
        }
    }
}

/// A root directory whose files are ingested under one project id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub root_path: String,
    pub project_type: ProjectType,
    #[serde(default)]
    pub excluded: bool,
    pub last_accessed: Option<DateTime<Utc>>,
}

// ============================================================================
// Queries
// ============================================================================

/// Traversal direction relative to the node being expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// One edge adjacent to an expanded node, with the node on the other end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub relationship: Relationship,
    pub node: GraphNode,
    /// `Outgoing` or `Incoming`, never `Both`.
    pub direction: Direction,
}

/// Which stored embedding a vector search compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingField {
    Name,
    #[default]
    Content,
    Description,
    /// Every concrete field; a node scores its best field.
    All,
}

impl EmbeddingField {
    pub const CONCRETE: [EmbeddingField; 3] = [
        EmbeddingField::Name,
        EmbeddingField::Content,
        EmbeddingField::Description,
    ];

    /// Node property holding the vector, `None` for `All`.
    pub fn property_name(&self) -> Option<&'static str> {
        match self {
            Self::Name => Some("embedding_name"),
            Self::Content => Some("embedding_content"),
            Self::Description => Some("embedding_description"),
            Self::All => None,
        }
    }

    /// Node property holding the text that gets embedded.
    pub fn source_property(&self) -> Option<&'static str> {
        match self {
            Self::Name => Some(props::NAME),
            Self::Content => Some(props::CONTENT),
            Self::Description => Some(props::DESCRIPTION),
            Self::All => None,
        }
    }

    /// Name of the Neo4j vector index for a concrete field.
    pub fn index_name(&self) -> Option<&'static str> {
        match self {
            Self::Name => Some("entity_embedding_name"),
            Self::Content => Some("entity_embedding_content"),
            Self::Description => Some("entity_embedding_description"),
            Self::All => None,
        }
    }

    pub fn concrete_fields(&self) -> Vec<EmbeddingField> {
        match self {
            Self::All => Self::CONCRETE.to_vec(),
            other => vec![*other],
        }
    }
}

/// Candidate filter shared by lexical and vector search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Empty means every project.
    #[serde(default)]
    pub project_ids: Vec<String>,
    /// Empty means every label.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Glob over `file_path`, e.g. `src/**/*.rs`.
    pub path_glob: Option<String>,
    /// Prefix over `file_path`.
    pub base_path: Option<String>,
}

impl NodeFilter {
    pub fn for_projects(project_ids: Vec<String>) -> Self {
        Self {
            project_ids,
            ..Default::default()
        }
    }

    /// Evaluate the filter in memory. The glob is compiled per call; callers
    /// filtering many nodes should use [`NodeFilter::compile_glob`] once.
    pub fn matches(&self, node: &GraphNode) -> bool {
        let glob = self.compile_glob().ok().flatten();
        self.matches_with(node, glob.as_ref())
    }

    pub fn compile_glob(&self) -> Result<Option<glob::Pattern>, glob::PatternError> {
        self.path_glob
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
    }

    pub fn matches_with(&self, node: &GraphNode, glob: Option<&glob::Pattern>) -> bool {
        if node.label == SOURCE_FILE_LABEL {
            return false;
        }
        if !self.project_ids.is_empty() && !self.project_ids.contains(&node.project_id) {
            return false;
        }
        if !self.labels.is_empty() && !self.labels.iter().any(|l| l == &node.label) {
            return false;
        }
        let path = node.file_path().unwrap_or_default();
        if let Some(base) = &self.base_path {
            if !path.starts_with(base.trim_start_matches("./")) {
                return false;
            }
        }
        if let Some(pattern) = glob {
            if !pattern.matches(path) {
                return false;
            }
        }
        true
    }
}

/// One page of a lexical candidate scan. `next_offset` is `None` once the
/// store has no more rows.
#[derive(Debug, Clone, Default)]
pub struct CandidatePage {
    pub nodes: Vec<GraphNode>,
    pub next_offset: Option<usize>,
}

// ============================================================================
// Write batches
// ============================================================================

/// Everything written for one file in one ingestion cycle. The store applies
/// it atomically: either all nodes, edges and the record land, or none do.
#[derive(Debug, Clone)]
pub struct FileWriteBatch {
    pub record: FileRecord,
    /// Created or changed nodes. Written with augment semantics.
    pub upsert_nodes: Vec<GraphNode>,
    /// Every relationship the file currently produces, merged on key.
    pub relationships: Vec<Relationship>,
}

impl FileWriteBatch {
    pub fn project_id(&self) -> &str {
        &self.record.project_id
    }

    pub fn path(&self) -> &str {
        &self.record.path
    }

    /// Keys of all relationships in the batch, for owned-edge replacement.
    pub fn relationship_keys(&self) -> Vec<String> {
        self.relationships.iter().map(|r| r.key_string()).collect()
    }
}
