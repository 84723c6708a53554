//! Content diff engine
//!
//! Two levels of change detection:
//! - file level: SHA-256 of the file bytes against the hash on its record,
//!   which lets unchanged files skip parsing entirely
//! - node level: SHA-256 of each derived node's label and properties against
//!   the stored node, which limits writes to nodes that actually changed and
//!   yields the orphan set

use crate::neo4j::models::{props, FileRecord, GraphNode};
use crate::neo4j::traits::GraphStore;
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Properties left out of a node's content hash: bookkeeping written by the
/// pipeline itself, not produced by parsing.
const UNHASHED_PROPERTIES: &[&str] = &[
    props::CONTENT_HASH,
    props::SCHEMA_DIRTY,
    props::EMBEDDINGS_DIRTY,
    "embedding_model",
    "embedded_at",
];

/// How a file's current bytes compare to what was last ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    /// Never ingested, or the record has no hash
    New,
    Changed,
    Unchanged,
}

/// Result of a file-level check.
#[derive(Debug, Clone)]
pub struct FileCheck {
    pub path: String,
    pub hash: String,
    pub change: FileChange,
    /// Current record, if the file was seen before
    pub record: Option<FileRecord>,
}

impl FileCheck {
    pub fn is_unchanged(&self) -> bool {
        self.change == FileChange::Unchanged
    }
}

/// Node-level diff of one file's new parse against the stored nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeDiff {
    /// New nodes, with `content_hash` set
    pub created: Vec<GraphNode>,
    /// Nodes whose hash changed, with the new `content_hash` set
    pub updated: Vec<GraphNode>,
    /// Nodes identical to the stored ones
    pub unchanged: Vec<Uuid>,
    /// Stored nodes the new parse no longer produces
    pub orphans: Vec<Uuid>,
}

impl NodeDiff {
    /// Nodes that need writing
    pub fn changed_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.created.iter().chain(self.updated.iter())
    }

    pub fn has_node_changes(&self) -> bool {
        !self.created.is_empty() || !self.updated.is_empty()
    }
}

pub struct ContentDiffEngine {
    store: Arc<dyn GraphStore>,
}

impl ContentDiffEngine {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Hex SHA-256 of raw bytes
    pub fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Hash of a node's label and parsed properties. The property map is a
    /// `BTreeMap`, so its JSON form is canonical.
    pub fn node_hash(node: &GraphNode) -> String {
        let hashed: std::collections::BTreeMap<&String, &serde_json::Value> = node
            .properties
            .iter()
            .filter(|(k, _)| !UNHASHED_PROPERTIES.contains(&k.as_str()) && !k.starts_with("embedding_"))
            .collect();
        let mut hasher = Sha256::new();
        hasher.update(node.label.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&hashed).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    /// Check one file's bytes against its record.
    pub async fn check_file(&self, project_id: &str, path: &str, bytes: &[u8]) -> Result<FileCheck> {
        let hash = Self::hash_bytes(bytes);
        let mut checks = self
            .check_batch(project_id, vec![(path.to_string(), hash)])
            .await?;
        Ok(checks.remove(0))
    }

    /// Check many files in one store round trip. Takes `(path, hash)` pairs
    /// and returns one check per pair, in order.
    pub async fn check_batch(
        &self,
        project_id: &str,
        files: Vec<(String, String)>,
    ) -> Result<Vec<FileCheck>> {
        let paths: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();
        let mut records: HashMap<String, FileRecord> = self
            .store
            .get_file_records(project_id, &paths)
            .await?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        Ok(files
            .into_iter()
            .map(|(path, hash)| {
                let record = records.remove(&path);
                let change = match record.as_ref().and_then(|r| r.content_hash.as_deref()) {
                    None => FileChange::New,
                    Some(stored) if stored == hash => FileChange::Unchanged,
                    Some(_) => FileChange::Changed,
                };
                FileCheck {
                    path,
                    hash,
                    change,
                    record,
                }
            })
            .collect())
    }

    /// Compare freshly parsed nodes with the nodes stored for the file.
    /// Sets `content_hash` on every returned node.
    pub async fn diff_nodes(
        &self,
        project_id: &str,
        path: &str,
        nodes: Vec<GraphNode>,
    ) -> Result<NodeDiff> {
        let stored: HashMap<Uuid, Option<String>> = self
            .store
            .get_file_node_digests(project_id, path)
            .await?
            .into_iter()
            .map(|d| (d.uuid, d.content_hash))
            .collect();

        let mut diff = NodeDiff::default();
        let mut seen: HashSet<Uuid> = HashSet::with_capacity(nodes.len());

        for mut node in nodes {
            let hash = Self::node_hash(&node);
            seen.insert(node.uuid);
            match stored.get(&node.uuid) {
                None => {
                    node.properties
                        .insert(props::CONTENT_HASH.into(), hash.into());
                    diff.created.push(node);
                }
                Some(Some(old)) if *old == hash => diff.unchanged.push(node.uuid),
                Some(_) => {
                    node.properties
                        .insert(props::CONTENT_HASH.into(), hash.into());
                    diff.updated.push(node);
                }
            }
        }

        diff.orphans = stored
            .keys()
            .filter(|uuid| !seen.contains(uuid))
            .copied()
            .collect();
        diff.orphans.sort();

        Ok(diff)
    }
}
