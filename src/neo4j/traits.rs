//! GraphStore trait definition
//!
//! Abstract interface over the graph database. `Neo4jClient` is the production
//! implementation; tests run against the in-memory `MockGraphStore`.

use crate::neo4j::models::*;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Abstract interface for all graph database operations used by ingestion,
/// search and exploration.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Project operations
    // ========================================================================

    /// Create or update a project by id
    async fn upsert_project(&self, project: &Project) -> Result<()>;

    /// List all registered projects
    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Update a project's `last_accessed` timestamp
    async fn touch_project(&self, project_id: &str) -> Result<()>;

    // ========================================================================
    // File records
    // ========================================================================

    /// Get the record of one file
    async fn get_file_record(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>>;

    /// Get the records of many files in one round trip. Unknown paths are
    /// simply absent from the result.
    async fn get_file_records(&self, project_id: &str, paths: &[String])
        -> Result<Vec<FileRecord>>;

    /// Create or replace a file record
    async fn upsert_file_record(&self, record: &FileRecord) -> Result<()>;

    /// List file records, optionally restricted to a project and/or state
    async fn list_file_records(
        &self,
        project_id: Option<&str>,
        state: Option<FileState>,
    ) -> Result<Vec<FileRecord>>;

    // ========================================================================
    // Derived nodes
    // ========================================================================

    /// Uuid, label and content hash of every node derived from a file
    async fn get_file_node_digests(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<Vec<StoredNodeDigest>>;

    /// Atomically write one file's nodes, owned relationships and record.
    ///
    /// Upserted nodes merge their properties into existing ones. Relationships
    /// owned by the file that are absent from the batch are removed.
    async fn commit_file_batch(&self, batch: &FileWriteBatch) -> Result<()>;

    /// Detach-delete nodes by uuid. Returns how many existed.
    async fn delete_nodes(&self, uuids: &[Uuid]) -> Result<usize>;

    /// Remove every node derived from the given files and their owned edges.
    /// File nodes, which hold the records, are kept. Returns the number of
    /// derived nodes removed.
    async fn delete_file_nodes(&self, project_id: &str, paths: &[String]) -> Result<usize>;

    /// Get a node by uuid
    async fn get_node(&self, uuid: Uuid) -> Result<Option<GraphNode>>;

    /// Get several nodes by uuid, in no particular order
    async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<GraphNode>>;

    // ========================================================================
    // Search and traversal
    // ========================================================================

    /// One page of nodes matching a filter whose text fields contain at
    /// least one of `terms` (any node when `terms` is empty). Pages are
    /// ordered by file path, start line and uuid.
    async fn find_candidates(
        &self,
        filter: &NodeFilter,
        terms: &[String],
        offset: usize,
        page_size: usize,
    ) -> Result<CandidatePage>;

    /// Nearest neighbours of `embedding` on a concrete embedding field,
    /// best first, with cosine similarity scores.
    async fn vector_search(
        &self,
        field: EmbeddingField,
        embedding: &[f32],
        filter: &NodeFilter,
        limit: usize,
    ) -> Result<Vec<(GraphNode, f64)>>;

    /// Relationships adjacent to a node and the nodes on their other end
    async fn get_neighbors(
        &self,
        uuid: Uuid,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Neighbor>>;

    // ========================================================================
    // Embeddings
    // ========================================================================

    /// Nodes whose `embeddings_dirty` flag is set
    async fn list_dirty_embedding_nodes(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<GraphNode>>;

    /// Store embeddings for a node and clear its dirty flag
    async fn set_node_embeddings(
        &self,
        uuid: Uuid,
        embeddings: &[(EmbeddingField, Vec<f32>)],
        model: &str,
    ) -> Result<()>;

    /// How many nodes of a file still wait for embeddings
    async fn count_dirty_embeddings_for_file(&self, project_id: &str, path: &str)
        -> Result<usize>;

    /// Atomically move a file record from `embedding_pending` to `embedded`.
    /// Applies only while the record is still `embedding_pending` with
    /// `expected_hash` and none of the file's nodes is dirty; returns whether
    /// it applied.
    async fn complete_file_embedding(
        &self,
        project_id: &str,
        path: &str,
        expected_hash: Option<&str>,
    ) -> Result<bool>;
}
