//! Error taxonomy for ingestion and search
//!
//! Most plumbing returns `anyhow::Result`. `CoreError` is used where a caller
//! has to tell failure categories apart: a parse failure on one file is
//! retried through the state machine, a missing embedding provider fails a
//! semantic search immediately, a lock timeout only marks results as stale.

use crate::neo4j::models::FileState;
use thiserror::Error;

/// Categorised failures surfaced by the core components.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The source adapter could not turn the file content into graph fragments.
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// The graph store rejected or could not receive a write batch.
    #[error("write error for {path}: {message}")]
    Write { path: String, message: String },

    /// A coordination lock was still held after the wait bound.
    #[error("timed out after {waited_ms}ms waiting for the {lock} lock")]
    LockTimeout { lock: String, waited_ms: u64 },

    /// The requested operation needs a collaborator that is not configured.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Some orphaned nodes could not be removed; they are retried next cycle.
    #[error("orphan cleanup failed for {path} ({remaining} nodes remaining): {message}")]
    OrphanCleanup {
        path: String,
        remaining: usize,
        message: String,
    },

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid state transition for {path}: {from} -> {to}")]
    InvalidTransition {
        path: String,
        from: FileState,
        to: FileState,
    },

    /// A parsed node does not satisfy the schema registered for its label.
    #[error("schema violation on {label} node: {message}")]
    SchemaViolation { label: String, message: String },

    /// The search query could not be compiled (bad regex, bad glob, ...).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Short machine-readable category, used as the `last_error` prefix on
    /// file records and in per-file ingestion error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::Write { .. } => "write_error",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::CapabilityUnavailable(_) => "capability_unavailable",
            Self::OrphanCleanup { .. } => "orphan_cleanup_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::InvalidQuery(_) => "invalid_query",
            Self::NotFound(_) => "not_found",
        }
    }

    /// Whether the failed unit of work should be retried on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. } | Self::Write { .. } | Self::OrphanCleanup { .. }
        )
    }
}
