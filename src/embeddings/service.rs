//! Embedding service
//!
//! Ingestion never calls the provider. Changed nodes are written with
//! `embeddings_dirty = true` and picked up here, either lazily by a semantic
//! search that needs fresh vectors for its projects or by the periodic sweep.
//! All provider work happens under the embedding lock.

use super::traits::EmbeddingProvider;
use crate::error::CoreError;
use crate::events::{EventBus, EventEmitter, GraphEvent};
use crate::ingest::state::FileStateMachine;
use crate::locks::CoordinationLocks;
use crate::neo4j::models::{EmbeddingField, FileRecord, FileState, GraphNode};
use crate::neo4j::traits::GraphStore;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one embedding pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbeddingPass {
    pub nodes_embedded: usize,
    /// Files moved from `embedding_pending` to `embedded`
    pub files_completed: Vec<String>,
    /// The embedding lock stayed busy past the wait bound; nothing was done
    pub lock_timed_out: bool,
}

impl EmbeddingPass {
    fn merge(&mut self, other: EmbeddingPass) {
        self.nodes_embedded += other.nodes_embedded;
        self.files_completed.extend(other.files_completed);
        self.lock_timed_out |= other.lock_timed_out;
    }
}

pub struct EmbeddingService {
    store: Arc<dyn GraphStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    locks: Arc<CoordinationLocks>,
    states: Arc<FileStateMachine>,
    events: EventBus,
    batch_size: usize,
}

impl EmbeddingService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        locks: Arc<CoordinationLocks>,
        states: Arc<FileStateMachine>,
        events: EventBus,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            provider,
            locks,
            states,
            events,
            batch_size: batch_size.max(1),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Embed a search query. Fails fast when no provider is configured.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            CoreError::CapabilityUnavailable(
                "vector search requires an embedding provider".to_string(),
            )
        })?;
        provider
            .embed_text(text)
            .await
            .context("Failed to embed search query")
    }

    /// Embed every dirty node, optionally of one project, under the
    /// embedding lock. Without a provider this is a no-op and files stay in
    /// `embedding_pending`.
    pub async fn embed_dirty(&self, project_id: Option<&str>) -> Result<EmbeddingPass> {
        let Some(provider) = self.provider.clone() else {
            return Ok(EmbeddingPass::default());
        };
        let description = match project_id {
            Some(p) => format!("embedding dirty nodes of {}", p),
            None => "embedding dirty nodes".to_string(),
        };
        let _guard = self.locks.embedding.acquire(description).await;
        self.embed_dirty_locked(provider.as_ref(), project_id).await
    }

    /// Bring the embeddings of the given projects up to date before a vector
    /// read. An empty slice means every project. Gives up, without failing,
    /// when another pass holds the lock past the wait bound.
    pub async fn ensure_fresh(&self, project_ids: &[String]) -> Result<EmbeddingPass> {
        let Some(provider) = self.provider.clone() else {
            return Ok(EmbeddingPass::default());
        };

        let guard = match self
            .locks
            .embedding
            .acquire_timeout("refreshing embeddings for search", self.locks.wait_timeout())
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Skipping embedding refresh: {}", e);
                return Ok(EmbeddingPass {
                    lock_timed_out: true,
                    ..Default::default()
                });
            }
        };

        let mut pass = EmbeddingPass::default();
        if project_ids.is_empty() {
            pass.merge(self.embed_dirty_locked(provider.as_ref(), None).await?);
        } else {
            for project_id in project_ids {
                pass.merge(
                    self.embed_dirty_locked(provider.as_ref(), Some(project_id))
                        .await?,
                );
            }
        }
        guard.release();
        Ok(pass)
    }

    async fn embed_dirty_locked(
        &self,
        provider: &dyn EmbeddingProvider,
        project_id: Option<&str>,
    ) -> Result<EmbeddingPass> {
        let mut pass = EmbeddingPass::default();

        loop {
            let nodes = self
                .store
                .list_dirty_embedding_nodes(project_id, self.batch_size)
                .await?;
            if nodes.is_empty() {
                break;
            }
            pass.nodes_embedded += self.embed_nodes(provider, &nodes).await?;
            if nodes.len() < self.batch_size {
                break;
            }
        }

        // Also picks up files whose last dirty node was embedded or deleted
        // by an earlier pass or an orphan cleanup
        for record in self
            .store
            .list_file_records(project_id, Some(FileState::EmbeddingPending))
            .await?
        {
            match self.complete_file(&record).await {
                Ok(true) => pass.files_completed.push(record.path),
                Ok(false) => {}
                Err(e) => warn!(
                    project_id = %record.project_id,
                    path = %record.path,
                    "Could not mark file embedded: {:#}",
                    e
                ),
            }
        }

        if pass.nodes_embedded > 0 || !pass.files_completed.is_empty() {
            info!(
                nodes = pass.nodes_embedded,
                files = pass.files_completed.len(),
                "Embeddings updated"
            );
            self.events.emit(GraphEvent::EmbeddingsUpdated {
                nodes: pass.nodes_embedded,
                files_completed: pass.files_completed.len(),
            });
        }
        Ok(pass)
    }

    /// Embed one batch of nodes with a single provider call. Nodes without any
    /// embeddable text only get their dirty flag cleared.
    async fn embed_nodes(&self, provider: &dyn EmbeddingProvider, nodes: &[GraphNode]) -> Result<usize> {
        let mut texts = Vec::new();
        let mut slots: Vec<(usize, EmbeddingField)> = Vec::new();
        for (idx, node) in nodes.iter().enumerate() {
            for field in EmbeddingField::CONCRETE {
                let text = field
                    .source_property()
                    .and_then(|p| node.text(p))
                    .map(str::trim)
                    .filter(|t| !t.is_empty());
                if let Some(text) = text {
                    texts.push(text.to_string());
                    slots.push((idx, field));
                }
            }
        }

        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            provider
                .embed_batch(&texts)
                .await
                .with_context(|| format!("Embedding provider failed on {} texts", texts.len()))?
        };
        if vectors.len() != slots.len() {
            anyhow::bail!(
                "Embedding provider returned {} vectors for {} texts",
                vectors.len(),
                slots.len()
            );
        }

        let mut per_node: Vec<Vec<(EmbeddingField, Vec<f32>)>> = vec![Vec::new(); nodes.len()];
        for ((idx, field), vector) in slots.into_iter().zip(vectors) {
            per_node[idx].push((field, vector));
        }

        for (node, embeddings) in nodes.iter().zip(per_node) {
            self.store
                .set_node_embeddings(node.uuid, &embeddings, provider.model_name())
                .await?;
        }
        debug!(nodes = nodes.len(), texts = texts.len(), "Embedded batch");
        Ok(nodes.len())
    }

    /// Move an `embedding_pending` file to `embedded` once none of its nodes
    /// is dirty. A record that changed since it was listed is left alone.
    async fn complete_file(&self, record: &FileRecord) -> Result<bool> {
        if self
            .store
            .count_dirty_embeddings_for_file(&record.project_id, &record.path)
            .await?
            > 0
        {
            return Ok(false);
        }
        self.states.complete_embedding(record).await
    }

    /// Embed dirty nodes every `interval` until cancelled. A tick is skipped
    /// while another pass holds the embedding lock.
    pub fn spawn_sweep(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(provider) = self.provider.clone() else {
                            continue;
                        };
                        let Some(guard) = self.locks.embedding.try_acquire("embedding sweep") else {
                            debug!("Embedding lock busy, skipping sweep tick");
                            continue;
                        };
                        if let Err(e) = self.embed_dirty_locked(provider.as_ref(), None).await {
                            tracing::error!("Embedding sweep failed: {:#}", e);
                        }
                        guard.release();
                    }
                }
            }
            debug!("Embedding sweep stopped");
        })
    }
}
