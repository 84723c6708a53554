//! `GraphStore` implementation for `Neo4jClient`.
//!
//! Every method simply delegates to the corresponding inherent method on `Neo4jClient`.

use async_trait::async_trait;
use uuid::Uuid;

use super::client::Neo4jClient;
use super::models::*;
use super::traits::GraphStore;

#[async_trait]
impl GraphStore for Neo4jClient {
    // ========================================================================
    // Project operations
    // ========================================================================

    async fn upsert_project(&self, project: &Project) -> anyhow::Result<()> {
        self.upsert_project(project).await
    }

    async fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        self.list_projects().await
    }

    async fn touch_project(&self, project_id: &str) -> anyhow::Result<()> {
        self.touch_project(project_id).await
    }

    // ========================================================================
    // File records
    // ========================================================================

    async fn get_file_record(
        &self,
        project_id: &str,
        path: &str,
    ) -> anyhow::Result<Option<FileRecord>> {
        self.get_file_record(project_id, path).await
    }

    async fn get_file_records(
        &self,
        project_id: &str,
        paths: &[String],
    ) -> anyhow::Result<Vec<FileRecord>> {
        self.get_file_records(project_id, paths).await
    }

    async fn upsert_file_record(&self, record: &FileRecord) -> anyhow::Result<()> {
        self.upsert_file_record(record).await
    }

    async fn list_file_records(
        &self,
        project_id: Option<&str>,
        state: Option<FileState>,
    ) -> anyhow::Result<Vec<FileRecord>> {
        self.list_file_records(project_id, state).await
    }

    // ========================================================================
    // Derived nodes
    // ========================================================================

    async fn get_file_node_digests(
        &self,
        project_id: &str,
        path: &str,
    ) -> anyhow::Result<Vec<StoredNodeDigest>> {
        self.get_file_node_digests(project_id, path).await
    }

    async fn commit_file_batch(&self, batch: &FileWriteBatch) -> anyhow::Result<()> {
        self.commit_file_batch(batch).await
    }

    async fn delete_nodes(&self, uuids: &[Uuid]) -> anyhow::Result<usize> {
        self.delete_nodes(uuids).await
    }

    async fn delete_file_nodes(&self, project_id: &str, paths: &[String]) -> anyhow::Result<usize> {
        self.delete_file_nodes(project_id, paths).await
    }

    async fn get_node(&self, uuid: Uuid) -> anyhow::Result<Option<GraphNode>> {
        self.get_node(uuid).await
    }

    async fn get_nodes(&self, uuids: &[Uuid]) -> anyhow::Result<Vec<GraphNode>> {
        self.get_nodes(uuids).await
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
    ) -> anyhow::Result<CandidatePage> {
        self.find_candidates(filter, terms, offset, page_size).await
    }

    async fn vector_search(
        &self,
        field: EmbeddingField,
        embedding: &[f32],
        filter: &NodeFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<(GraphNode, f64)>> {
        self.vector_search(field, embedding, filter, limit).await
    }

    async fn get_neighbors(
        &self,
        uuid: Uuid,
        direction: Direction,
        limit: usize,
    ) -> anyhow::Result<Vec<Neighbor>> {
        self.get_neighbors(uuid, direction, limit).await
    }

    // ========================================================================
    // Embeddings
    // ========================================================================

    async fn list_dirty_embedding_nodes(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<GraphNode>> {
        self.list_dirty_embedding_nodes(project_id, limit).await
    }

    async fn set_node_embeddings(
        &self,
        uuid: Uuid,
        embeddings: &[(EmbeddingField, Vec<f32>)],
        model: &str,
    ) -> anyhow::Result<()> {
        self.set_node_embeddings(uuid, embeddings, model).await
    }

    async fn count_dirty_embeddings_for_file(
        &self,
        project_id: &str,
        path: &str,
    ) -> anyhow::Result<usize> {
        self.count_dirty_embeddings_for_file(project_id, path).await
    }

    async fn complete_file_embedding(
        &self,
        project_id: &str,
        path: &str,
        expected_hash: Option<&str>,
    ) -> anyhow::Result<bool> {
        self.complete_file_embedding(project_id, path, expected_hash)
            .await
    }
}
