//! Knowledge Sync
//!
//! Keeps a Neo4j knowledge graph in step with files on disk and serves
//! hybrid search over it:
//! - Incremental ingestion: content-hash diffing, atomic per-file upserts,
//!   orphan cleanup and a per-file lifecycle state machine with recovery
//! - A debounced, coalescing ingestion queue fed by a file watcher and by
//!   file-modified events
//! - Two coordination locks so search never observes a half-written batch
//! - Lexical, vector and RRF-fused hybrid search with fuzzy keyword boosting
//! - Bounded relationship exploration to enrich results

pub mod edit;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod explorer;
pub mod ingest;
pub mod locks;
pub mod neo4j;
pub mod orchestrator;
pub mod projects;
pub mod search;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use error::CoreError;

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Config sections
// ============================================================================

/// Neo4j connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".into(),
            user: "neo4j".into(),
            password: "knowledge-sync".into(),
        }
    }
}

/// Ingestion pipeline and recovery
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Files processed concurrently within one batch
    pub concurrency: usize,
    /// Quiet period before the queue drains
    pub debounce_ms: u64,
    /// A drain never takes more events than this
    pub max_batch_size: usize,
    pub max_retries: u32,
    /// In-flight files older than this are considered abandoned
    pub stuck_threshold_ms: u64,
    pub recovery_interval_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            debounce_ms: 500,
            max_batch_size: 200,
            max_retries: 3,
            stuck_threshold_ms: 5 * 60 * 1000,
            recovery_interval_ms: 60 * 1000,
        }
    }
}

impl IngestionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }
}

/// How long readers wait for the coordination locks
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5 * 60 * 1000,
            poll_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Search ranking
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// RRF constant `k`
    pub rrf_k: f64,
    /// Maximum score a keyword boost adds
    pub boost_weight: f64,
    /// Keyword similarities below this add no boost
    pub boost_similarity_floor: f64,
    /// Default per-token edit distance, 0 to 2
    pub fuzzy_distance: u8,
    pub default_limit: usize,
    /// Default cosine threshold of semantic and hybrid searches
    pub semantic_min_score: f64,
    /// Upper bound on the candidate pool of one search leg
    pub candidate_limit: usize,
    /// Nodes read per store round trip while a lexical search scans
    pub scan_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: search::fusion::RRF_K,
            boost_weight: 0.15,
            boost_similarity_floor: 0.6,
            fuzzy_distance: 1,
            default_limit: 20,
            semantic_min_score: 0.3,
            candidate_limit: 5000,
            scan_page_size: 2000,
        }
    }
}

/// Embedding provider. An empty `url` (or `disabled`) means no provider:
/// search is lexical only and files stay `embedding_pending`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// OpenAI-compatible `/embeddings` endpoint
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub batch_size: usize,
    pub sweep_interval_ms: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "nomic-embed-text".into(),
            api_key: None,
            dimensions: 768,
            batch_size: 32,
            sweep_interval_ms: 30 * 1000,
        }
    }
}

impl EmbeddingsConfig {
    pub fn is_enabled(&self) -> bool {
        let url = self.url.trim();
        !url.is_empty() && !url.eq_ignore_ascii_case("disabled")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ============================================================================
// Runtime config
// ============================================================================

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub neo4j: Neo4jConfig,
    pub ingestion: IngestionConfig,
    pub locks: LockConfig,
    pub search: SearchConfig,
    pub embeddings: EmbeddingsConfig,
}

/// Parsed env var, or `fallback` when unset or unparsable
fn env_or<T: FromStr>(name: &str, fallback: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
                fallback
            }
        },
        Err(_) => fallback,
    }
}

impl Config {
    /// Load configuration from env vars and defaults only.
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);
        let mut config = yaml.clone();

        config.neo4j.uri = std::env::var("NEO4J_URI").unwrap_or(yaml.neo4j.uri);
        config.neo4j.user = std::env::var("NEO4J_USER").unwrap_or(yaml.neo4j.user);
        config.neo4j.password = std::env::var("NEO4J_PASSWORD").unwrap_or(yaml.neo4j.password);

        config.ingestion.concurrency = env_or("INGEST_CONCURRENCY", yaml.ingestion.concurrency);
        config.ingestion.debounce_ms = env_or("INGEST_DEBOUNCE_MS", yaml.ingestion.debounce_ms);
        config.ingestion.stuck_threshold_ms =
            env_or("STUCK_THRESHOLD_MS", yaml.ingestion.stuck_threshold_ms);
        config.locks.wait_timeout_ms = env_or("LOCK_WAIT_TIMEOUT_MS", yaml.locks.wait_timeout_ms);

        config.search.rrf_k = env_or("SEARCH_RRF_K", yaml.search.rrf_k);
        config.search.boost_weight = env_or("SEARCH_BOOST_WEIGHT", yaml.search.boost_weight);
        config.search.fuzzy_distance =
            env_or("SEARCH_FUZZY_DISTANCE", yaml.search.fuzzy_distance).min(2);

        config.embeddings.url = std::env::var("EMBEDDING_URL").unwrap_or(yaml.embeddings.url);
        config.embeddings.model = std::env::var("EMBEDDING_MODEL").unwrap_or(yaml.embeddings.model);
        config.embeddings.api_key = std::env::var("EMBEDDING_API_KEY")
            .ok()
            .or(yaml.embeddings.api_key);
        config.embeddings.dimensions =
            env_or("EMBEDDING_DIMENSIONS", yaml.embeddings.dimensions);

        Ok(config)
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> Config {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Config::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                Config::default()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
