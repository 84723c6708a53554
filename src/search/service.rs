//! Search service
//!
//! Every search waits (bounded) for queued edits and running ingestion
//! batches before reading; vector modes also wait for the embedding lock and
//! embed the dirty nodes of the searched projects first. A wait that times
//! out never fails the search, it marks the response `possibly_stale`.

use super::boost::apply_keyword_boost;
use super::fusion::reciprocal_rank_fusion;
use super::lexical::LexicalMatcher;
use super::models::{sort_results, SearchMode, SearchRequest, SearchResponse, SearchResult};
use super::vector::merge_field_hits;
use crate::embeddings::EmbeddingService;
use crate::error::CoreError;
use crate::explorer::RelationshipExplorer;
use crate::ingest::IngestionQueue;
use crate::locks::{CoordinationLocks, PendingWork};
use crate::neo4j::models::{EmbeddingField, NodeFilter};
use crate::neo4j::traits::GraphStore;
use crate::projects::ProjectRegistry;
use crate::SearchConfig;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Each ranked leg keeps this many times the requested limit, so fusion and
/// boosting can promote results from below the cut.
const POOL_FACTOR: usize = 4;

pub struct SearchService {
    store: Arc<dyn GraphStore>,
    projects: Arc<ProjectRegistry>,
    locks: Arc<CoordinationLocks>,
    queue: Option<Arc<IngestionQueue>>,
    embeddings: Arc<EmbeddingService>,
    explorer: Arc<RelationshipExplorer>,
    config: SearchConfig,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        projects: Arc<ProjectRegistry>,
        locks: Arc<CoordinationLocks>,
        embeddings: Arc<EmbeddingService>,
        explorer: Arc<RelationshipExplorer>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            projects,
            locks,
            queue: None,
            embeddings,
            explorer,
            config,
        }
    }

    /// Also wait for this queue to drain before reading.
    pub fn with_queue(mut self, queue: Arc<IngestionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let start = Instant::now();
        let fuzzy = request.fuzzy_distance.unwrap_or(self.config.fuzzy_distance);
        let matcher =
            LexicalMatcher::new(&request.query, request.regex, fuzzy, request.context_lines)?;
        if request.mode.needs_vectors() && !self.embeddings.has_provider() {
            return Err(CoreError::CapabilityUnavailable(format!(
                "{:?} search requires an embedding provider",
                request.mode
            ))
            .into());
        }
        request
            .filter
            .compile_glob()
            .map_err(|e| CoreError::InvalidQuery(format!("bad path glob: {}", e)))?;

        let limit = request.limit.unwrap_or(self.config.default_limit).max(1);
        let pool = (limit * POOL_FACTOR).min(self.config.candidate_limit.max(limit));
        let searched_projects = self.resolve_projects(&request.filter);

        let mut response = SearchResponse {
            results: Vec::new(),
            total_count: 0,
            searched_projects: searched_projects.clone(),
            mode: request.mode,
            waited_for_edits: false,
            possibly_stale: false,
            keyword_boosted: false,
        };
        if searched_projects.is_empty() {
            debug!("No searchable projects match the filter");
            return Ok(response);
        }
        let filter = NodeFilter {
            project_ids: searched_projects.clone(),
            ..request.filter.clone()
        };

        if request.wait_for_edits {
            let pending = self.queue.as_deref().map(|q| q as &dyn PendingWork);
            let wait = self
                .locks
                .wait_for_consistency(pending, request.mode.needs_vectors(), None)
                .await;
            response.waited_for_edits = wait.waited;
            response.possibly_stale = wait.timed_out;

            if request.mode.needs_vectors() {
                match self.embeddings.ensure_fresh(&searched_projects).await {
                    Ok(pass) => response.possibly_stale |= pass.lock_timed_out,
                    Err(e) => {
                        warn!("Embedding refresh failed, vector scores may be stale: {:#}", e);
                        response.possibly_stale = true;
                    }
                }
            }
        }

        let vector_min = request.min_score.unwrap_or(self.config.semantic_min_score);
        let mut results = match request.mode {
            SearchMode::Lexical => {
                let mut results = self.lexical_search(&matcher, &filter).await?;
                if let Some(min) = request.min_score {
                    results.retain(|r| r.score >= min);
                }
                results
            }
            SearchMode::Semantic => {
                self.vector_search(&request.query, request.embedding_field, &filter, pool, vector_min)
                    .await?
            }
            SearchMode::Hybrid => {
                self.hybrid_search(
                    &matcher,
                    &request.query,
                    request.embedding_field,
                    &filter,
                    pool,
                    vector_min,
                )
                .await?
            }
        };

        if !request.boost_keywords.is_empty() {
            response.keyword_boosted = apply_keyword_boost(
                &mut results,
                &request.boost_keywords,
                self.config.boost_weight,
                self.config.boost_similarity_floor,
            );
        }
        response.total_count = results.len();
        results.truncate(limit);
        for result in results.iter_mut() {
            result.node.strip_embeddings();
        }
        if let Some(options) = &request.explore {
            self.explorer.enrich_results(&mut results, options).await;
        }
        if let Err(e) = self.projects.touch(&searched_projects).await {
            warn!("Failed to record project access: {:#}", e);
        }

        debug!(
            mode = ?request.mode,
            results = results.len(),
            total = response.total_count,
            stale = response.possibly_stale,
            "Search finished in {}ms",
            start.elapsed().as_millis()
        );
        response.results = results;
        Ok(response)
    }

    /// Score the filter's candidates lexically, best first. The store only
    /// returns nodes holding one of the matcher's prefilter terms; those are
    /// read page by page until the store runs out.
    pub async fn lexical_search(
        &self,
        matcher: &LexicalMatcher,
        filter: &NodeFilter,
    ) -> Result<Vec<SearchResult>> {
        let terms = matcher.prefilter_terms().unwrap_or_default();
        let page_size = self.config.scan_page_size.max(1);
        let mut results = Vec::new();
        let mut offset = Some(0);
        let mut scanned = 0;
        while let Some(from) = offset {
            let page = self
                .store
                .find_candidates(filter, &terms, from, page_size)
                .await?;
            scanned += page.nodes.len();
            results.extend(page.nodes.into_iter().filter_map(|node| {
                let (score, range) = matcher.score(&node)?;
                let mut result = SearchResult::new(node, score);
                result.matched_range = range;
                Some(result)
            }));
            offset = page.next_offset;
        }
        debug!(scanned, matched = results.len(), "Lexical scan finished");
        sort_results(&mut results);
        Ok(results)
    }

    /// Cosine similarity against one embedding field, or the best of all
    /// fields for [`EmbeddingField::All`]. Hits under `min_score` are dropped.
    pub async fn vector_search(
        &self,
        query: &str,
        field: EmbeddingField,
        filter: &NodeFilter,
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        let embedding = self.embeddings.embed_query(query).await?;
        let mut lists = Vec::new();
        for field in field.concrete_fields() {
            lists.push(
                self.store
                    .vector_search(field, &embedding, filter, limit)
                    .await?,
            );
        }
        Ok(merge_field_hits(lists)
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .take(limit)
            .map(|(node, score)| SearchResult::new(node, score))
            .collect())
    }

    /// Lexical and vector legs run concurrently over the same filter and are
    /// fused with RRF. Lexical match ranges survive fusion.
    pub async fn hybrid_search(
        &self,
        matcher: &LexicalMatcher,
        query: &str,
        field: EmbeddingField,
        filter: &NodeFilter,
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>> {
        let (lexical, vector) = tokio::join!(
            self.lexical_search(matcher, filter),
            self.vector_search(query, field, filter, limit, min_score)
        );
        let mut lexical = lexical?;
        lexical.truncate(limit);
        let vector = vector?;

        let lists: Vec<Vec<Uuid>> = vec![
            lexical.iter().map(|r| r.node.uuid).collect(),
            vector.iter().map(|r| r.node.uuid).collect(),
        ];
        debug!(
            lexical = lists[0].len(),
            vector = lists[1].len(),
            "Fusing hybrid legs"
        );

        let mut by_uuid: HashMap<Uuid, SearchResult> = HashMap::new();
        for result in vector.into_iter().chain(lexical) {
            // lexical entries come last and carry the matched range
            by_uuid.insert(result.node.uuid, result);
        }
        Ok(reciprocal_rank_fusion(&lists, self.config.rrf_k)
            .into_iter()
            .filter_map(|(uuid, score)| {
                by_uuid.remove(&uuid).map(|mut result| {
                    result.score = score;
                    result
                })
            })
            .collect())
    }

    /// Non-excluded projects named by the filter, or all of them
    fn resolve_projects(&self, filter: &NodeFilter) -> Vec<String> {
        let searchable = self.projects.searchable_ids();
        if filter.project_ids.is_empty() {
            return searchable;
        }
        filter
            .project_ids
            .iter()
            .filter(|id| searchable.contains(id))
            .cloned()
            .collect()
    }
}
