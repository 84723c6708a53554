//! File lifecycle state machine
//!
//! ```text
//! discovered -> queued -> parsing -> parsed -> embedding_pending -> embedded
//!                  ^                    \______________________________^
//!                  |
//!                error   (any live state may fail; error is retried via queued)
//! every live state may restart at queued, including an abandoned parsing
//! deleted <- any state; deleted -> discovered | queued when the path reappears
//! ```
//!
//! Records live on `SourceFile` nodes. [`FileStateMachine::reset_stuck_files`]
//! turns files left in an in-flight state by a crashed worker into retryable
//! errors; `IngestionManager::spawn_recovery_sweep` runs it and then retries
//! them.

use crate::error::CoreError;
use crate::events::{EventBus, EventEmitter, GraphEvent};
use crate::neo4j::models::{FileRecord, FileState};
use crate::neo4j::traits::GraphStore;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Whether `from -> to` is a legal lifecycle step.
pub fn can_transition(from: FileState, to: FileState) -> bool {
    use FileState::*;
    match (from, to) {
        (_, Deleted) => true,
        (Deleted, Discovered | Queued) => true,
        (Deleted, _) => false,
        (_, Error) => true,
        // any non-deleted state restarts, including a parse a dead worker left behind
        (Discovered | Queued | Parsing | Error | Parsed | EmbeddingPending | Embedded, Queued) => {
            true
        }
        (Queued, Parsing) => true,
        (Parsing, Parsed) => true,
        (Parsed, EmbeddingPending | Embedded) => true,
        (EmbeddingPending, Embedded) => true,
        _ => false,
    }
}

/// Apply a transition to a record in memory.
///
/// Entering `parsed` clears the error fields; entering `error` is done with
/// [`fail`] so the message and retry count are always set together.
pub fn advance(record: &mut FileRecord, to: FileState) -> Result<(), CoreError> {
    if !can_transition(record.state, to) || to == FileState::Error {
        return Err(CoreError::InvalidTransition {
            path: record.path.clone(),
            from: record.state,
            to,
        });
    }
    let now = Utc::now();
    if to == FileState::Parsed {
        record.last_error = None;
        record.retry_count = 0;
        record.last_processed_at = Some(now);
    }
    if to == FileState::Deleted {
        record.content_hash = None;
        record.pending_orphans.clear();
    }
    record.state = to;
    record.state_changed_at = now;
    Ok(())
}

/// Move a record to `error`, recording why. The message is prefixed with the
/// error kind so the cause category survives a round trip through the store.
pub fn fail(record: &mut FileRecord, kind: &str, message: &str) -> Result<(), CoreError> {
    if !can_transition(record.state, FileState::Error) {
        return Err(CoreError::InvalidTransition {
            path: record.path.clone(),
            from: record.state,
            to: FileState::Error,
        });
    }
    record.state = FileState::Error;
    record.last_error = Some(format!("{}: {}", kind, message));
    record.retry_count += 1;
    record.state_changed_at = Utc::now();
    Ok(())
}

/// Count of files per lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionProgress {
    pub counts: BTreeMap<FileState, usize>,
    pub total: usize,
}

impl IngestionProgress {
    pub fn count(&self, state: FileState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Fraction of live files that reached `embedded`
    pub fn completion(&self) -> f64 {
        let live = self.total - self.count(FileState::Deleted);
        if live == 0 {
            return 1.0;
        }
        self.count(FileState::Embedded) as f64 / live as f64
    }
}

pub struct FileStateMachine {
    store: Arc<dyn GraphStore>,
    events: EventBus,
    max_retries: u32,
    stuck_threshold: Duration,
}

impl FileStateMachine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        events: EventBus,
        max_retries: u32,
        stuck_threshold: Duration,
    ) -> Self {
        Self {
            store,
            events,
            max_retries,
            stuck_threshold,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn load(&self, project_id: &str, path: &str) -> Result<FileRecord> {
        Ok(self
            .store
            .get_file_record(project_id, path)
            .await?
            .unwrap_or_else(|| FileRecord::discovered(project_id, path)))
    }

    /// Persist a validated transition. Unknown files start as `discovered`.
    pub async fn transition(
        &self,
        project_id: &str,
        path: &str,
        to: FileState,
    ) -> Result<FileRecord> {
        let mut record = self.load(project_id, path).await?;
        let from = record.state;
        advance(&mut record, to)?;
        self.store.upsert_file_record(&record).await?;
        debug!(project_id = %project_id, path = %path, "File state {} -> {}", from, to);
        Ok(record)
    }

    /// Move `record` from `embedding_pending` to `embedded` unless the stored
    /// record moved on since it was read, or the file still has dirty nodes.
    /// The check and the update are one store operation, so a concurrent
    /// ingestion of the file is never overwritten.
    pub async fn complete_embedding(&self, record: &FileRecord) -> Result<bool> {
        let completed = self
            .store
            .complete_file_embedding(
                &record.project_id,
                &record.path,
                record.content_hash.as_deref(),
            )
            .await?;
        if completed {
            debug!(project_id = %record.project_id, path = %record.path, "File state embedding_pending -> embedded");
        }
        Ok(completed)
    }

    /// Persist a failure: state `error`, `last_error` set, retry count bumped.
    pub async fn mark_error(
        &self,
        project_id: &str,
        path: &str,
        error: &CoreError,
    ) -> Result<FileRecord> {
        let mut record = self.load(project_id, path).await?;
        fail(&mut record, error.kind(), &error.to_string())?;
        self.store.upsert_file_record(&record).await?;
        warn!(project_id = %project_id, path = %path, "File failed: {}", error);
        Ok(record)
    }

    pub async fn get_files_in_state(
        &self,
        project_id: Option<&str>,
        state: FileState,
    ) -> Result<Vec<FileRecord>> {
        self.store.list_file_records(project_id, Some(state)).await
    }

    /// Files in `error` that have retries left
    pub async fn get_retryable_files(&self, project_id: Option<&str>) -> Result<Vec<FileRecord>> {
        Ok(self
            .get_files_in_state(project_id, FileState::Error)
            .await?
            .into_iter()
            .filter(|r| r.retry_count < self.max_retries)
            .collect())
    }

    pub async fn get_progress(&self, project_id: Option<&str>) -> Result<IngestionProgress> {
        let records = self.store.list_file_records(project_id, None).await?;
        let mut progress = IngestionProgress {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            *progress.counts.entry(record.state).or_default() += 1;
        }
        Ok(progress)
    }

    /// Turn files stuck in an in-flight state for longer than the threshold
    /// into retryable errors. Returns the reset records.
    pub async fn reset_stuck_files(&self) -> Result<Vec<FileRecord>> {
        let threshold = chrono::Duration::from_std(self.stuck_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let cutoff = Utc::now() - threshold;

        let mut reset = Vec::new();
        for state in FileState::ALL.into_iter().filter(|s| s.is_in_flight()) {
            for mut record in self.store.list_file_records(None, Some(state)).await? {
                if record.state_changed_at > cutoff {
                    continue;
                }
                let message = format!(
                    "stuck in {} for more than {}ms, assumed abandoned",
                    record.state,
                    self.stuck_threshold.as_millis()
                );
                fail(&mut record, "stuck", &message)?;
                self.store.upsert_file_record(&record).await?;
                reset.push(record);
            }
        }

        if !reset.is_empty() {
            info!("Reset {} stuck files", reset.len());
            self.events.emit(GraphEvent::StuckFilesReset {
                paths: reset.iter().map(|r| r.path.clone()).collect(),
            });
        }
        Ok(reset)
    }
}
