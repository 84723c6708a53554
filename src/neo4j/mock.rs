//! In-memory mock implementation of GraphStore for testing.
//!
//! All collections sit behind one `tokio::sync::RwLock` so a batch commit is
//! atomic with respect to readers, like a Neo4j transaction. Writes are
//! counted and failures can be injected to exercise retry paths.
//! Conditionally compiled with `#[cfg(test)]`.

use crate::neo4j::models::*;
use crate::neo4j::traits::GraphStore;
use crate::search::vector::cosine_similarity;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    projects: HashMap<String, Project>,
    records: HashMap<(String, String), FileRecord>,
    nodes: HashMap<Uuid, GraphNode>,
    relationships: HashMap<RelationshipKey, Relationship>,
}

/// In-memory mock implementation of GraphStore for testing.
#[derive(Default)]
pub struct MockGraphStore {
    state: RwLock<MockState>,
    writes: AtomicUsize,
    /// Fail the next `commit_file_batch` before touching any data.
    pub fail_next_commit: AtomicBool,
    /// Fail every `delete_nodes` call while set.
    pub fail_node_deletes: AtomicBool,
    /// Sleep inside `commit_file_batch`, to keep the ingestion lock held.
    commit_delay_ms: AtomicUsize,
    /// Record written by the next `count_dirty_embeddings_for_file`, the way
    /// an ingestion finishing mid-pass would.
    record_change_on_count: std::sync::Mutex<Option<FileRecord>>,
}

impl MockGraphStore {
    /// Create a new empty MockGraphStore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_commit_delay(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Write `record` right before the next dirty-embedding count answers.
    pub fn change_record_on_next_count(&self, record: FileRecord) {
        *self
            .record_change_on_count
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(record);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Seed a node directly, bypassing the write counter.
    pub async fn insert_node(&self, node: GraphNode) {
        self.state.write().await.nodes.insert(node.uuid, node);
    }

    /// Seed a relationship directly, bypassing the write counter.
    pub async fn insert_relationship(&self, rel: Relationship) {
        self.state
            .write()
            .await
            .relationships
            .insert(rel.key(), rel);
    }

    /// Derived nodes (excluding file nodes) currently stored.
    pub async fn derived_node_count(&self) -> usize {
        self.state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.label != SOURCE_FILE_LABEL)
            .count()
    }

    pub async fn all_relationships(&self) -> Vec<Relationship> {
        let mut rels: Vec<Relationship> = self
            .state
            .read()
            .await
            .relationships
            .values()
            .cloned()
            .collect();
        rels.sort_by_key(|r| r.key());
        rels
    }

    /// Derived nodes of one file, ordered by start line.
    pub async fn nodes_for_file(&self, project_id: &str, path: &str) -> Vec<GraphNode> {
        let state = self.state.read().await;
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| is_derived_from(n, project_id, path))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.start_line(), n.uuid));
        nodes
    }
}

fn is_derived_from(node: &GraphNode, project_id: &str, path: &str) -> bool {
    node.label != SOURCE_FILE_LABEL
        && node.project_id == project_id
        && node.file_path() == Some(path)
}

fn owned_by(rel: &Relationship, project_id: &str, path: &str) -> bool {
    rel.properties.get(props::PROJECT_ID).and_then(|v| v.as_str()) == Some(project_id)
        && rel.properties.get(props::SOURCE_FILE).and_then(|v| v.as_str()) == Some(path)
}

fn file_node(record: &FileRecord) -> GraphNode {
    GraphNode::new(
        crate::ingest::identity::file_node_uuid(&record.project_id, &record.path),
        SOURCE_FILE_LABEL,
        record.project_id.clone(),
    )
    .with_property(props::FILE_PATH, record.path.clone())
    .with_property("state", record.state.as_str())
}

#[async_trait]
impl GraphStore for MockGraphStore {
    // ========================================================================
    // Project operations
    // ========================================================================

    async fn upsert_project(&self, project: &Project) -> Result<()> {
        self.record_write();
        self.state
            .write()
            .await
            .projects
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> =
            self.state.read().await.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn touch_project(&self, project_id: &str) -> Result<()> {
        if let Some(p) = self.state.write().await.projects.get_mut(project_id) {
            p.last_accessed = Some(Utc::now());
        }
        Ok(())
    }

    // ========================================================================
    // File records
    // ========================================================================

    async fn get_file_record(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .state
            .read()
            .await
            .records
            .get(&(project_id.to_string(), path.to_string()))
            .cloned())
    }

    async fn get_file_records(
        &self,
        project_id: &str,
        paths: &[String],
    ) -> Result<Vec<FileRecord>> {
        let state = self.state.read().await;
        Ok(paths
            .iter()
            .filter_map(|p| state.records.get(&(project_id.to_string(), p.clone())))
            .cloned()
            .collect())
    }

    async fn upsert_file_record(&self, record: &FileRecord) -> Result<()> {
        self.record_write();
        self.state.write().await.records.insert(
            (record.project_id.clone(), record.path.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn list_file_records(
        &self,
        project_id: Option<&str>,
        state: Option<FileState>,
    ) -> Result<Vec<FileRecord>> {
        let guard = self.state.read().await;
        let mut records: Vec<FileRecord> = guard
            .records
            .values()
            .filter(|r| project_id.map_or(true, |p| r.project_id == p))
            .filter(|r| state.map_or(true, |s| r.state == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| (&a.project_id, &a.path).cmp(&(&b.project_id, &b.path)));
        Ok(records)
    }

    // ========================================================================
    // Derived nodes
    // ========================================================================

    async fn get_file_node_digests(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<StoredNodeDigest>> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .filter(|n| is_derived_from(n, project_id, path))
            .map(|n| StoredNodeDigest {
                uuid: n.uuid,
                label: n.label.clone(),
                content_hash: n.content_hash().map(str::to_string),
            })
            .collect())
    }

    async fn commit_file_batch(&self, batch: &FileWriteBatch) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            bail!("injected commit failure for {}", batch.path());
        }
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.record_write();

        let mut state = self.state.write().await;
        let fnode = file_node(&batch.record);
        state.nodes.insert(fnode.uuid, fnode);

        for node in &batch.upsert_nodes {
            match state.nodes.get_mut(&node.uuid) {
                Some(existing) => {
                    existing.label = node.label.clone();
                    existing.project_id = node.project_id.clone();
                    for (k, v) in &node.properties {
                        existing.properties.insert(k.clone(), v.clone());
                    }
                }
                None => {
                    state.nodes.insert(node.uuid, node.clone());
                }
            }
        }

        let keep: HashSet<RelationshipKey> = batch.relationships.iter().map(|r| r.key()).collect();
        state
            .relationships
            .retain(|k, r| keep.contains(k) || !owned_by(r, batch.project_id(), batch.path()));

        for rel in &batch.relationships {
            if !state.nodes.contains_key(&rel.from) || !state.nodes.contains_key(&rel.to) {
                continue;
            }
            let mut rel = rel.clone();
            rel.properties
                .insert(props::PROJECT_ID.into(), batch.project_id().into());
            rel.properties
                .insert(props::SOURCE_FILE.into(), batch.path().into());
            state.relationships.insert(rel.key(), rel);
        }

        state.records.insert(
            (batch.record.project_id.clone(), batch.record.path.clone()),
            batch.record.clone(),
        );
        Ok(())
    }

    async fn delete_nodes(&self, uuids: &[Uuid]) -> Result<usize> {
        if self.fail_node_deletes.load(Ordering::SeqCst) {
            bail!("injected delete failure for {} nodes", uuids.len());
        }
        self.record_write();
        let mut state = self.state.write().await;
        let targets: HashSet<Uuid> = uuids.iter().copied().collect();
        let before = state.nodes.len();
        state.nodes.retain(|id, _| !targets.contains(id));
        let removed = before - state.nodes.len();
        state
            .relationships
            .retain(|k, _| !targets.contains(&k.from) && !targets.contains(&k.to));
        Ok(removed)
    }

    async fn delete_file_nodes(&self, project_id: &str, paths: &[String]) -> Result<usize> {
        self.record_write();
        let mut state = self.state.write().await;
        let path_set: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let targets: HashSet<Uuid> = state
            .nodes
            .values()
            .filter(|n| {
                n.label != SOURCE_FILE_LABEL
                    && n.project_id == project_id
                    && n.file_path().is_some_and(|p| path_set.contains(p))
            })
            .map(|n| n.uuid)
            .collect();
        state.nodes.retain(|id, _| !targets.contains(id));
        state.relationships.retain(|k, r| {
            let owned = paths.iter().any(|p| owned_by(r, project_id, p));
            !owned && !targets.contains(&k.from) && !targets.contains(&k.to)
        });
        Ok(targets.len())
    }

    async fn get_node(&self, uuid: Uuid) -> Result<Option<GraphNode>> {
        Ok(self.state.read().await.nodes.get(&uuid).cloned())
    }

    async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<GraphNode>> {
        let state = self.state.read().await;
        Ok(uuids
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .cloned()
            .collect())
    }

    // ========================================================================
    // Search and traversal
    // ========================================================================

    async fn find_candidates(
        &self,
        filter: &NodeFilter,
        terms: &[String],
        offset: usize,
        page_size: usize,
    ) -> Result<CandidatePage> {
        let glob = filter.compile_glob()?;
        // the glob is applied per page, like the Neo4j client does
        let without_glob = NodeFilter {
            path_glob: None,
            ..filter.clone()
        };
        let state = self.state.read().await;
        let mut rows: Vec<&GraphNode> = state
            .nodes
            .values()
            .filter(|n| without_glob.matches_with(n, None) && n.contains_any_term(terms))
            .collect();
        rows.sort_by(|a, b| {
            (a.file_path(), a.start_line(), a.uuid).cmp(&(b.file_path(), b.start_line(), b.uuid))
        });
        let page: Vec<&GraphNode> = rows.into_iter().skip(offset).take(page_size).collect();
        let read = page.len();
        Ok(CandidatePage {
            nodes: page
                .into_iter()
                .filter(|n| filter.matches_with(n, glob.as_ref()))
                .cloned()
                .collect(),
            next_offset: (read >= page_size).then_some(offset + read),
        })
    }

    async fn vector_search(
        &self,
        field: EmbeddingField,
        embedding: &[f32],
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(GraphNode, f64)>> {
        let glob = filter.compile_glob()?;
        let state = self.state.read().await;
        let mut scored: Vec<(GraphNode, f64)> = state
            .nodes
            .values()
            .filter(|n| filter.matches_with(n, glob.as_ref()))
            .filter_map(|n| {
                let stored = n.embedding(field)?;
                Some((n.clone(), cosine_similarity(embedding, &stored)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.uuid.cmp(&b.0.uuid)));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_neighbors(
        &self,
        uuid: Uuid,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Neighbor>> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for rel in state.relationships.values() {
            let (other, dir) = if rel.from == uuid
                && matches!(direction, Direction::Outgoing | Direction::Both)
            {
                (rel.to, Direction::Outgoing)
            } else if rel.to == uuid && matches!(direction, Direction::Incoming | Direction::Both)
            {
                (rel.from, Direction::Incoming)
            } else {
                continue;
            };
            if let Some(node) = state.nodes.get(&other) {
                out.push(Neighbor {
                    relationship: rel.clone(),
                    node: node.clone(),
                    direction: dir,
                });
            }
        }
        out.sort_by(|a, b| {
            (&a.relationship.rel_type, a.direction, a.node.uuid).cmp(&(
                &b.relationship.rel_type,
                b.direction,
                b.node.uuid,
            ))
        });
        out.truncate(limit);
        Ok(out)
    }

    // ========================================================================
    // Embeddings
    // ========================================================================

    async fn list_dirty_embedding_nodes(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        let state = self.state.read().await;
        let mut nodes: Vec<GraphNode> = state
            .nodes
            .values()
            .filter(|n| n.label != SOURCE_FILE_LABEL && n.embeddings_dirty())
            .filter(|n| project_id.map_or(true, |p| n.project_id == p))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.uuid);
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn set_node_embeddings(
        &self,
        uuid: Uuid,
        embeddings: &[(EmbeddingField, Vec<f32>)],
        model: &str,
    ) -> Result<()> {
        self.record_write();
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.get_mut(&uuid) {
            for (field, vector) in embeddings {
                if let Some(prop) = field.property_name() {
                    node.properties
                        .insert(prop.to_string(), serde_json::json!(vector));
                }
            }
            node.properties
                .insert("embedding_model".into(), model.into());
            node.properties
                .insert(props::EMBEDDINGS_DIRTY.into(), false.into());
        }
        Ok(())
    }

    async fn count_dirty_embeddings_for_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<usize> {
        let change = self
            .record_change_on_count
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(record) = change {
            self.upsert_file_record(&record).await?;
        }
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .filter(|n| is_derived_from(n, project_id, path) && n.embeddings_dirty())
            .count())
    }

    async fn complete_file_embedding(
        &self,
        project_id: &str,
        path: &str,
        expected_hash: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let dirty = state
            .nodes
            .values()
            .any(|n| is_derived_from(n, project_id, path) && n.embeddings_dirty());
        let key = (project_id.to_string(), path.to_string());
        let Some(record) = state.records.get_mut(&key) else {
            return Ok(false);
        };
        if dirty
            || record.state != FileState::EmbeddingPending
            || record.content_hash.as_deref() != expected_hash
        {
            return Ok(false);
        }
        record.state = FileState::Embedded;
        record.state_changed_at = Utc::now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived(project: &str, path: &str, name: &str) -> GraphNode {
        GraphNode::new(Uuid::new_v4(), "Function", project)
            .with_property(props::FILE_PATH, path)
            .with_property(props::NAME, name)
    }

    fn batch(nodes: Vec<GraphNode>, rels: Vec<Relationship>) -> FileWriteBatch {
        FileWriteBatch {
            record: FileRecord::discovered("p", "a.rs"),
            upsert_nodes: nodes,
            relationships: rels,
        }
    }

    #[tokio::test]
    async fn test_commit_merges_properties() {
        let store = MockGraphStore::new();
        let n = derived("p", "a.rs", "foo").with_property("extra", "kept");
        store.commit_file_batch(&batch(vec![n.clone()], vec![])).await.unwrap();

        let mut update = n.clone();
        update.properties.remove("extra");
        update.properties.insert(props::NAME.into(), "bar".into());
        store.commit_file_batch(&batch(vec![update], vec![])).await.unwrap();

        let stored = store.get_node(n.uuid).await.unwrap().unwrap();
        assert_eq!(stored.name(), Some("bar"));
        assert_eq!(stored.text("extra"), Some("kept"));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_replaces_owned_relationships() {
        let store = MockGraphStore::new();
        let a = derived("p", "a.rs", "a");
        let b = derived("p", "a.rs", "b");
        let c = derived("p", "a.rs", "c");
        let ab = Relationship::new(a.uuid, b.uuid, "CALLS");
        let ac = Relationship::new(a.uuid, c.uuid, "CALLS");
        store
            .commit_file_batch(&batch(vec![a.clone(), b.clone(), c.clone()], vec![ab, ac.clone()]))
            .await
            .unwrap();
        assert_eq!(store.all_relationships().await.len(), 2);

        store
            .commit_file_batch(&batch(vec![], vec![ac.clone()]))
            .await
            .unwrap();
        let rels = store.all_relationships().await;
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].key(), ac.key());
    }

    #[tokio::test]
    async fn test_injected_commit_failure_writes_nothing() {
        let store = MockGraphStore::new();
        store.fail_next_commit.store(true, Ordering::SeqCst);
        let err = store
            .commit_file_batch(&batch(vec![derived("p", "a.rs", "x")], vec![]))
            .await;
        assert!(err.is_err());
        assert_eq!(store.derived_node_count().await, 0);
        assert!(store.get_file_record("p", "a.rs").await.unwrap().is_none());
        // Only the next commit fails
        store.commit_file_batch(&batch(vec![], vec![])).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_file_nodes_keeps_records() {
        let store = MockGraphStore::new();
        store
            .commit_file_batch(&batch(vec![derived("p", "a.rs", "x")], vec![]))
            .await
            .unwrap();
        let removed = store.delete_file_nodes("p", &["a.rs".into()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.derived_node_count().await, 0);
        assert!(store.get_file_record("p", "a.rs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_neighbors_respect_direction() {
        let store = MockGraphStore::new();
        let a = derived("p", "a.rs", "a");
        let b = derived("p", "a.rs", "b");
        store.insert_node(a.clone()).await;
        store.insert_node(b.clone()).await;
        store
            .insert_relationship(Relationship::new(a.uuid, b.uuid, "CALLS"))
            .await;

        let out = store.get_neighbors(a.uuid, Direction::Outgoing, 10).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].node.uuid, b.uuid);
        assert!(store
            .get_neighbors(a.uuid, Direction::Incoming, 10)
            .await
            .unwrap()
            .is_empty());
        let both = store.get_neighbors(b.uuid, Direction::Both, 10).await.unwrap();
        assert_eq!(both[0].direction, Direction::Incoming);
    }
}
