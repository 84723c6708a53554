//! Incremental ingestion manager
//!
//! Per file, under the ingestion lock:
//! 1. file-level hash check, skipping unchanged files without any write
//! 2. parse through the matching `SourceAdapter`
//! 3. deterministic uuids, project tagging and schema validation
//! 4. node-level diff against the stored nodes
//! 5. one atomic batch with changed nodes, every owned relationship and the
//!    record; changed nodes are flagged `embeddings_dirty`
//! 6. orphan deletion, after the batch has committed and outside it
//! 7. final lifecycle state
//!
//! Orphan deletion is not part of the batch. When it runs, the file's new
//! content is already committed, so a failed deletion does not fail the file.
//! It is reported as an `orphan_cleanup_error` and the file keeps its normal
//! state. The leftover uuids are parked in `FileRecord::pending_orphans` and
//! the next cycle deletes them even when the content is unchanged; until then
//! they stay searchable.
//!
//! A failure on one file puts that file in `error` and never touches the
//! other files of the batch.

use super::adapter::{AdapterRegistry, NodeRef, ParseOptions, ParsedFragment};
use super::diff::ContentDiffEngine;
use super::identity::{file_node_uuid, node_uuid, normalize_relative_path};
use super::queue::{coalesce, ChangeEvent, ChangeSink, ChangeType};
use super::schema::SchemaRegistry;
use super::state::{advance, FileStateMachine};
use crate::error::CoreError;
use crate::events::{EventBus, EventEmitter, GraphEvent};
use crate::locks::CoordinationLocks;
use crate::neo4j::models::{
    props, FileRecord, FileState, FileWriteBatch, GraphNode, Project, Relationship, DEFINED_IN,
};
use crate::neo4j::traits::GraphStore;
use crate::projects::ProjectRegistry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directories never walked by [`IngestionManager::ingest_directory`]
pub const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

/// One file that failed during a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

impl FileError {
    fn new(path: &str, error: &CoreError) -> Self {
        Self {
            path: path.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Counts for one ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionStats {
    pub files_processed: usize,
    /// Unchanged, unsupported or excluded files
    pub files_skipped: usize,
    pub files_deleted: usize,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub nodes_deleted: usize,
    pub nodes_unchanged: usize,
    pub relationships_written: usize,
    pub errors: usize,
    pub orphan_cleanup_failures: usize,
    pub error_details: Vec<FileError>,
}

impl IngestionStats {
    pub fn merge(&mut self, other: IngestionStats) {
        self.files_processed += other.files_processed;
        self.files_skipped += other.files_skipped;
        self.files_deleted += other.files_deleted;
        self.nodes_created += other.nodes_created;
        self.nodes_updated += other.nodes_updated;
        self.nodes_deleted += other.nodes_deleted;
        self.nodes_unchanged += other.nodes_unchanged;
        self.relationships_written += other.relationships_written;
        self.errors += other.errors;
        self.orphan_cleanup_failures += other.orphan_cleanup_failures;
        self.error_details.extend(other.error_details);
    }

    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Skipped => self.files_skipped += 1,
            FileOutcome::Ingested(counts) => {
                self.files_processed += 1;
                self.nodes_created += counts.created;
                self.nodes_updated += counts.updated;
                self.nodes_unchanged += counts.unchanged;
                self.nodes_deleted += counts.deleted;
                self.relationships_written += counts.relationships;
                if let Some(err) = counts.orphan_error {
                    self.orphan_cleanup_failures += 1;
                    self.error_details.push(err);
                }
            }
            FileOutcome::Deleted(nodes) => {
                self.files_deleted += 1;
                self.nodes_deleted += nodes;
            }
            FileOutcome::Failed(err) => {
                self.errors += 1;
                self.error_details.push(err);
            }
        }
    }
}

#[derive(Debug, Default)]
struct NodeCounts {
    created: usize,
    updated: usize,
    unchanged: usize,
    deleted: usize,
    relationships: usize,
    orphan_error: Option<FileError>,
}

#[derive(Debug)]
enum FileOutcome {
    Skipped,
    Ingested(NodeCounts),
    Deleted(usize),
    Failed(FileError),
}

fn write_error(path: &str, e: anyhow::Error) -> CoreError {
    CoreError::Write {
        path: path.to_string(),
        message: format!("{:#}", e),
    }
}

fn is_identifier(s: &str) -> bool {
    s.starts_with(|c: char| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub struct IngestionManager {
    store: Arc<dyn GraphStore>,
    projects: Arc<ProjectRegistry>,
    states: Arc<FileStateMachine>,
    locks: Arc<CoordinationLocks>,
    events: EventBus,
    adapters: AdapterRegistry,
    schema: SchemaRegistry,
    diff: ContentDiffEngine,
    concurrency: usize,
}

impl IngestionManager {
    pub fn new(
        store: Arc<dyn GraphStore>,
        projects: Arc<ProjectRegistry>,
        states: Arc<FileStateMachine>,
        locks: Arc<CoordinationLocks>,
        events: EventBus,
    ) -> Self {
        Self {
            diff: ContentDiffEngine::new(store.clone()),
            store,
            projects,
            states,
            locks,
            events,
            adapters: AdapterRegistry::with_defaults(),
            schema: SchemaRegistry::new(),
            concurrency: 4,
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = schema;
        self
    }

    /// Maximum number of files parsed and written at the same time
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Apply change events to one project. Event paths may be absolute or
    /// relative to the project root.
    pub async fn ingest(&self, project_id: &str, events: Vec<ChangeEvent>) -> Result<IngestionStats> {
        self.run(project_id, events, false).await
    }

    /// Re-ingest files ignoring the content hash check.
    pub async fn re_ingest_files(&self, project_id: &str, paths: &[String]) -> Result<IngestionStats> {
        let events = paths
            .iter()
            .map(|p| ChangeEvent::new(p, ChangeType::Updated))
            .collect();
        self.run(project_id, events, true).await
    }

    /// Remove every node derived from the given files.
    pub async fn delete_nodes_for_files(
        &self,
        project_id: &str,
        paths: &[String],
    ) -> Result<IngestionStats> {
        let project = self.project(project_id)?;
        let _guard = self
            .locks
            .ingestion
            .acquire(format!("deleting {} files in {}", paths.len(), project_id))
            .await;
        let mut stats = IngestionStats::default();
        for path in paths {
            let path = normalize_relative_path(Path::new(path));
            stats.record(self.delete_file(&project, &path).await);
        }
        Ok(stats)
    }

    /// Re-ingest every file in `error` that has retries left.
    pub async fn retry_failed(&self, project_id: Option<&str>) -> Result<IngestionStats> {
        self.retry_errors(project_id, None).await
    }

    /// Like [`retry_failed`](Self::retry_failed), limited to files that
    /// failed before `failed_before` when it is set.
    async fn retry_errors(
        &self,
        project_id: Option<&str>,
        failed_before: Option<DateTime<Utc>>,
    ) -> Result<IngestionStats> {
        let mut by_project: BTreeMap<String, Vec<ChangeEvent>> = BTreeMap::new();
        for record in self.states.get_retryable_files(project_id).await? {
            if failed_before.is_some_and(|t| record.state_changed_at >= t) {
                continue;
            }
            by_project
                .entry(record.project_id)
                .or_default()
                .push(ChangeEvent::new(record.path, ChangeType::Updated));
        }

        let mut stats = IngestionStats::default();
        for (project_id, events) in by_project {
            info!(project_id = %project_id, files = events.len(), "Retrying failed files");
            stats.merge(self.ingest(&project_id, events).await?);
        }
        Ok(stats)
    }

    /// Every `interval` until cancelled: turn stuck files into errors, then
    /// retry every file in `error` that has retries left.
    pub fn spawn_recovery_sweep(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.states.reset_stuck_files().await {
                            tracing::error!("Stuck file recovery failed: {}", e);
                        }
                        match self.retry_failed(None).await {
                            Ok(stats) if stats.files_processed + stats.errors > 0 => {
                                debug!(
                                    processed = stats.files_processed,
                                    errors = stats.errors,
                                    "Recovery sweep retried failed files"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("Retrying failed files failed: {}", e),
                        }
                    }
                }
            }
            debug!("Recovery sweep stopped");
        })
    }

    /// Ingest every supported file under the project root, and remove the
    /// files that have a record but no longer exist on disk.
    pub async fn ingest_directory(&self, project_id: &str) -> Result<IngestionStats> {
        let project = self.project(project_id)?;
        let root = PathBuf::from(&project.root_path);
        let adapters = self.adapters.clone();

        let on_disk: Vec<String> = tokio::task::spawn_blocking(move || {
            walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0
                        || !e
                            .file_name()
                            .to_str()
                            .is_some_and(|n| IGNORED_DIRS.contains(&n))
                })
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && adapters.supports(e.path()))
                .filter_map(|e| {
                    e.path()
                        .strip_prefix(&root)
                        .ok()
                        .map(normalize_relative_path)
                })
                .collect()
        })
        .await
        .context("directory walk panicked")?;

        let present: HashSet<&str> = on_disk.iter().map(String::as_str).collect();
        let mut events: Vec<ChangeEvent> = self
            .store
            .list_file_records(Some(project_id), None)
            .await?
            .into_iter()
            .filter(|r| r.state != FileState::Deleted && !present.contains(r.path.as_str()))
            .map(|r| ChangeEvent::new(r.path, ChangeType::Deleted))
            .collect();
        events.extend(
            on_disk
                .iter()
                .map(|p| ChangeEvent::new(p, ChangeType::Updated)),
        );

        info!(
            project_id = %project_id,
            files = on_disk.len(),
            removed = events.len() - on_disk.len(),
            "Directory scan complete"
        );
        self.ingest(project_id, events).await
    }

    // ========================================================================
    // Batch processing
    // ========================================================================

    fn project(&self, project_id: &str) -> Result<Project> {
        Ok(self
            .projects
            .get(project_id)
            .ok_or_else(|| CoreError::NotFound(format!("project {}", project_id)))?)
    }

    /// Path relative to the project root, `None` if it lies outside.
    fn relative_path(project: &Project, path: &Path) -> Option<String> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&project.root_path).ok()?
        } else {
            path
        };
        let normalized = normalize_relative_path(relative);
        (!normalized.is_empty()).then_some(normalized)
    }

    async fn run(&self, project_id: &str, events: Vec<ChangeEvent>, force: bool) -> Result<IngestionStats> {
        let project = self.project(project_id)?;
        if project.excluded {
            debug!(project_id = %project_id, "Project excluded, ignoring {} events", events.len());
            return Ok(IngestionStats {
                files_skipped: events.len(),
                ..Default::default()
            });
        }

        let start = Instant::now();
        let _guard = self
            .locks
            .ingestion
            .acquire(format!("ingesting {} files in {}", events.len(), project_id))
            .await;

        let mut stats = IngestionStats::default();
        let mut changes: BTreeMap<String, ChangeType> = BTreeMap::new();
        for event in events {
            match Self::relative_path(&project, &event.path) {
                Some(path) => {
                    let previous = changes.get(&path).copied();
                    changes.insert(path, coalesce(previous, event.change_type));
                }
                None => {
                    warn!(project_id = %project_id, path = %event.path.display(), "Path outside project root");
                    stats.files_skipped += 1;
                }
            }
        }

        let (deleted, changed): (Vec<_>, Vec<_>) = changes
            .into_iter()
            .partition(|(_, change)| *change == ChangeType::Deleted);

        for (path, _) in &deleted {
            stats.record(self.delete_file(&project, path).await);
        }

        let files: Vec<_> = changed
            .iter()
            .map(|(path, _)| self.process_file(&project, path, force))
            .collect();
        let outcomes: Vec<FileOutcome> = stream::iter(files)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            stats.record(outcome);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            project_id = %project_id,
            processed = stats.files_processed,
            skipped = stats.files_skipped,
            deleted = stats.files_deleted,
            errors = stats.errors,
            nodes_created = stats.nodes_created,
            nodes_updated = stats.nodes_updated,
            nodes_deleted = stats.nodes_deleted,
            "Ingestion batch completed in {}ms",
            duration_ms
        );
        self.events.emit(GraphEvent::BatchCompleted {
            project_id: project_id.to_string(),
            files_processed: stats.files_processed,
            files_skipped: stats.files_skipped,
            errors: stats.errors,
            duration_ms,
        });
        Ok(stats)
    }

    /// Process one file, containing any failure to that file.
    async fn process_file(&self, project: &Project, path: &str, force: bool) -> FileOutcome {
        match self.try_process_file(project, path, force).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if let Err(e) = self.states.mark_error(&project.id, path, &error).await {
                    warn!(project_id = %project.id, path = %path, "Could not record failure: {:#}", e);
                }
                self.events.emit(GraphEvent::FileFailed {
                    project_id: project.id.clone(),
                    path: path.to_string(),
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                });
                FileOutcome::Failed(FileError::new(path, &error))
            }
        }
    }

    async fn try_process_file(
        &self,
        project: &Project,
        path: &str,
        force: bool,
    ) -> Result<FileOutcome, CoreError> {
        let absolute = ProjectRegistry::absolute_path(project, path);
        let bytes = match tokio::fs::read(&absolute).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "File vanished, treating as deleted");
                return Ok(self.delete_file(project, path).await);
            }
            Err(e) => {
                return Err(CoreError::Parse {
                    path: path.to_string(),
                    message: format!("failed to read file: {}", e),
                })
            }
        };

        let Some(adapter) = self.adapters.for_path(Path::new(path)) else {
            debug!(path = %path, "No adapter for file, skipping");
            return Ok(FileOutcome::Skipped);
        };

        let check = self
            .diff
            .check_file(&project.id, path, &bytes)
            .await
            .map_err(|e| write_error(path, e))?;
        let mut record = check
            .record
            .clone()
            .unwrap_or_else(|| FileRecord::discovered(&project.id, path));

        let settled = matches!(
            record.state,
            FileState::EmbeddingPending | FileState::Embedded
        );
        if check.is_unchanged() && !force && settled {
            if record.pending_orphans.is_empty() {
                debug!(path = %path, "Content unchanged, skipping");
                return Ok(FileOutcome::Skipped);
            }
            return Ok(self.retry_pending_orphans(record).await);
        }

        if record.state != FileState::Queued {
            advance(&mut record, FileState::Queued)?;
        }
        advance(&mut record, FileState::Parsing)?;
        self.store
            .upsert_file_record(&record)
            .await
            .map_err(|e| write_error(path, e))?;

        let fragment = adapter
            .parse(ParseOptions {
                project_id: &project.id,
                path,
                content: &bytes,
            })
            .await
            .map_err(|e| CoreError::Parse {
                path: path.to_string(),
                message: format!("{:#}", e),
            })?;
        let (nodes, relationships) = self.build_graph(&project.id, path, fragment)?;
        let current: HashSet<Uuid> = nodes.iter().map(|n| n.uuid).collect();

        let diff = self
            .diff
            .diff_nodes(&project.id, path, nodes)
            .await
            .map_err(|e| write_error(path, e))?;

        let upsert_nodes: Vec<GraphNode> = diff
            .changed_nodes()
            .cloned()
            .map(|node| {
                node.with_property(props::SCHEMA_DIRTY, false)
                    .with_property(props::EMBEDDINGS_DIRTY, true)
            })
            .collect();

        let orphans: Vec<Uuid> = diff
            .orphans
            .iter()
            .chain(record.pending_orphans.iter())
            .filter(|uuid| !current.contains(uuid))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        advance(&mut record, FileState::Parsed)?;
        record.content_hash = Some(check.hash.clone());
        // Parked until the deletion below succeeds, so a crash in between
        // does not lose them
        record.pending_orphans = orphans.clone();

        let batch = FileWriteBatch {
            record: record.clone(),
            upsert_nodes,
            relationships,
        };
        self.store
            .commit_file_batch(&batch)
            .await
            .map_err(|e| write_error(path, e))?;

        let mut counts = NodeCounts {
            created: diff.created.len(),
            updated: diff.updated.len(),
            unchanged: diff.unchanged.len(),
            relationships: batch.relationships.len(),
            ..Default::default()
        };

        let (deleted, remaining, orphan_error) = self.delete_orphans(path, &orphans).await;
        counts.deleted = deleted;
        counts.orphan_error = orphan_error;
        record.pending_orphans = remaining;

        let dirty = self
            .store
            .count_dirty_embeddings_for_file(&project.id, path)
            .await
            .map_err(|e| write_error(path, e))?;
        let final_state = if dirty > 0 {
            FileState::EmbeddingPending
        } else {
            FileState::Embedded
        };
        advance(&mut record, final_state)?;
        self.store
            .upsert_file_record(&record)
            .await
            .map_err(|e| write_error(path, e))?;

        debug!(
            project_id = %project.id,
            path = %path,
            created = counts.created,
            updated = counts.updated,
            unchanged = counts.unchanged,
            deleted = counts.deleted,
            "File ingested"
        );
        self.events.emit(GraphEvent::FileIngested {
            project_id: project.id.clone(),
            path: path.to_string(),
            created: counts.created,
            updated: counts.updated,
            deleted: counts.deleted,
        });
        Ok(FileOutcome::Ingested(counts))
    }

    /// Turn an adapter fragment into graph nodes and relationships: uuids,
    /// project and path tagging, schema validation, reference resolution and
    /// `DEFINED_IN` edges to the file node.
    fn build_graph(
        &self,
        project_id: &str,
        path: &str,
        fragment: ParsedFragment,
    ) -> Result<(Vec<GraphNode>, Vec<Relationship>), CoreError> {
        let file_uuid = file_node_uuid(project_id, path);
        let mut index: HashMap<(String, String), Uuid> = HashMap::new();
        let mut nodes = Vec::with_capacity(fragment.nodes.len());

        for parsed in fragment.nodes {
            let uuid = node_uuid(project_id, path, &parsed.label, &parsed.key);
            if index
                .insert((parsed.label.clone(), parsed.key.clone()), uuid)
                .is_some()
            {
                return Err(CoreError::SchemaViolation {
                    label: parsed.label,
                    message: format!("duplicate node key '{}'", parsed.key),
                });
            }
            let mut node = GraphNode::new(uuid, parsed.label, project_id);
            node.properties = parsed.properties;
            let node = node.with_property(props::FILE_PATH, path);
            self.schema.validate(&node)?;
            nodes.push(node);
        }

        let resolve = |r: &NodeRef| -> Result<Uuid, CoreError> {
            match r {
                NodeRef::External(uuid) => Ok(*uuid),
                NodeRef::Local { label, key } => index
                    .get(&(label.clone(), key.clone()))
                    .copied()
                    .ok_or_else(|| CoreError::SchemaViolation {
                        label: label.clone(),
                        message: format!("relationship references unknown node '{}'", key),
                    }),
            }
        };

        let mut relationships = Vec::with_capacity(fragment.relationships.len() + nodes.len());
        let mut seen = HashSet::new();
        for parsed in &fragment.relationships {
            if !is_identifier(&parsed.rel_type) {
                return Err(CoreError::SchemaViolation {
                    label: parsed.rel_type.clone(),
                    message: "relationship type must be an alphanumeric identifier".into(),
                });
            }
            let mut rel = Relationship::new(resolve(&parsed.from)?, resolve(&parsed.to)?, &parsed.rel_type);
            rel.properties = parsed.properties.clone();
            if seen.insert(rel.key()) {
                relationships.push(rel);
            }
        }
        for node in &nodes {
            relationships.push(Relationship::new(node.uuid, file_uuid, DEFINED_IN));
        }

        Ok((nodes, relationships))
    }

    /// Delete orphaned nodes. Returns `(deleted, still pending, error)`.
    async fn delete_orphans(
        &self,
        path: &str,
        orphans: &[Uuid],
    ) -> (usize, Vec<Uuid>, Option<FileError>) {
        if orphans.is_empty() {
            return (0, Vec::new(), None);
        }
        match self.store.delete_nodes(orphans).await {
            Ok(deleted) => (deleted, Vec::new(), None),
            Err(e) => {
                let error = CoreError::OrphanCleanup {
                    path: path.to_string(),
                    remaining: orphans.len(),
                    message: format!("{:#}", e),
                };
                warn!("{}", error);
                (0, orphans.to_vec(), Some(FileError::new(path, &error)))
            }
        }
    }

    /// Content unchanged but orphans of an earlier cycle are still around.
    async fn retry_pending_orphans(&self, mut record: FileRecord) -> FileOutcome {
        let orphans = std::mem::take(&mut record.pending_orphans);
        let (deleted, remaining, orphan_error) = self.delete_orphans(&record.path, &orphans).await;
        if remaining.is_empty() {
            if let Err(e) = self.store.upsert_file_record(&record).await {
                warn!(path = %record.path, "Could not clear pending orphans: {:#}", e);
            }
        }
        debug!(path = %record.path, deleted, "Retried pending orphan cleanup");
        FileOutcome::Ingested(NodeCounts {
            deleted,
            orphan_error,
            ..Default::default()
        })
    }

    /// Remove a file's nodes and mark its record deleted. Must be called
    /// with the ingestion lock held.
    async fn delete_file(&self, project: &Project, path: &str) -> FileOutcome {
        let result: Result<usize, CoreError> = async {
            let removed = self
                .store
                .delete_file_nodes(&project.id, &[path.to_string()])
                .await
                .map_err(|e| write_error(path, e))?;
            let record = self
                .store
                .get_file_record(&project.id, path)
                .await
                .map_err(|e| write_error(path, e))?;
            if let Some(mut record) = record.filter(|r| r.state != FileState::Deleted) {
                advance(&mut record, FileState::Deleted)?;
                self.store
                    .upsert_file_record(&record)
                    .await
                    .map_err(|e| write_error(path, e))?;
            }
            Ok(removed)
        }
        .await;

        match result {
            Ok(removed) => {
                debug!(project_id = %project.id, path = %path, removed, "File removed");
                self.events.emit(GraphEvent::FileDeleted {
                    project_id: project.id.clone(),
                    path: path.to_string(),
                    nodes_removed: removed,
                });
                FileOutcome::Deleted(removed)
            }
            Err(error) => {
                warn!(project_id = %project.id, path = %path, "Removing file failed: {}", error);
                FileOutcome::Failed(FileError::new(path, &error))
            }
        }
    }
}

#[async_trait]
impl ChangeSink for IngestionManager {
    /// Route drained events to their projects. Events of excluded projects
    /// are dropped. Files of those projects that failed in an earlier cycle
    /// are retried after the drained events.
    async fn process(&self, events: Vec<ChangeEvent>) -> Result<IngestionStats> {
        let drain_started = Utc::now();
        let mut stats = IngestionStats::default();
        let mut by_project: BTreeMap<String, Vec<ChangeEvent>> = BTreeMap::new();
        for event in events {
            match self.projects.resolve(&event.path).await? {
                Some((project, _)) => by_project.entry(project.id).or_default().push(event),
                None => stats.files_skipped += 1,
            }
        }

        for (project_id, events) in by_project {
            let count = events.len();
            match self.ingest(&project_id, events).await {
                Ok(project_stats) => stats.merge(project_stats),
                Err(e) => {
                    warn!(project_id = %project_id, "Ingestion failed: {:#}", e);
                    stats.errors += count;
                    continue;
                }
            }
            match self.retry_errors(Some(&project_id), Some(drain_started)).await {
                Ok(retried) => stats.merge(retried),
                Err(e) => warn!(project_id = %project_id, "Retrying failed files failed: {:#}", e),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::adapter::{ParsedNode, ParsedRelationship, SourceAdapter};
    use crate::neo4j::mock::MockGraphStore;
    use crate::neo4j::models::ProjectType;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    const FIVE_BLOCKS: &str = "# Intro\n\nalpha\n\nbeta\nbeta two\n\ngamma\n\ndelta\n";

    struct Harness {
        dir: TempDir,
        store: Arc<MockGraphStore>,
        events: EventBus,
        manager: IngestionManager,
        locks: Arc<CoordinationLocks>,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MockGraphStore::new());
            let events = EventBus::default();
            let locks = Arc::new(CoordinationLocks::default());
            let projects = Arc::new(ProjectRegistry::new(store.clone()));
            projects
                .register("p", dir.path(), ProjectType::TrackedProject)
                .await
                .unwrap();
            let states = Arc::new(FileStateMachine::new(
                store.clone(),
                events.clone(),
                3,
                Duration::from_secs(300),
            ));
            let manager = IngestionManager::new(
                store.clone(),
                projects,
                states,
                locks.clone(),
                events.clone(),
            );
            Self {
                dir,
                store,
                events,
                manager,
                locks,
            }
        }

        fn write(&self, path: &str, content: &str) {
            let full = self.dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }

        async fn ingest(&self, path: &str) -> IngestionStats {
            self.manager
                .ingest("p", vec![ChangeEvent::new(self.dir.path().join(path), ChangeType::Updated)])
                .await
                .unwrap()
        }

        async fn record(&self, path: &str) -> FileRecord {
            self.store.get_file_record("p", path).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_ingest_creates_nodes_and_edges() {
        let h = Harness::new().await;
        h.write("a.md", FIVE_BLOCKS);

        let stats = h.ingest("a.md").await;
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.nodes_created, 6);
        assert_eq!(stats.errors, 0);

        let nodes = h.store.nodes_for_file("p", "a.md").await;
        assert_eq!(nodes.len(), 6);
        assert!(nodes.iter().all(|n| n.embeddings_dirty() && !n.schema_dirty()));
        assert!(nodes.iter().all(|n| n.project_id == "p"));

        let rels = h.store.all_relationships().await;
        let defined_in = rels.iter().filter(|r| r.rel_type == DEFINED_IN).count();
        assert_eq!(defined_in, 6);
        assert!(rels.iter().all(|r| r.properties[props::SOURCE_FILE] == "a.md"));

        let record = h.record("a.md").await;
        assert_eq!(record.state, FileState::EmbeddingPending);
        assert!(record.content_hash.is_some());
        assert!(record.last_processed_at.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_file_produces_zero_writes() {
        let h = Harness::new().await;
        h.write("a.md", FIVE_BLOCKS);
        h.ingest("a.md").await;

        let before = h.store.write_count();
        let stats = h.ingest("a.md").await;
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(stats.files_processed, 0);
        assert_eq!(h.store.write_count(), before);
    }

    #[tokio::test]
    async fn test_ingestion_is_deterministic() {
        let h = Harness::new().await;
        h.write("a.md", FIVE_BLOCKS);
        h.ingest("a.md").await;
        let first: BTreeSet<Uuid> = h.store.nodes_for_file("p", "a.md").await.iter().map(|n| n.uuid).collect();
        let rels_before = h.store.all_relationships().await.len();

        h.manager.re_ingest_files("p", &["a.md".to_string()]).await.unwrap();
        let second: BTreeSet<Uuid> = h.store.nodes_for_file("p", "a.md").await.iter().map(|n| n.uuid).collect();
        assert_eq!(first, second);
        assert_eq!(h.store.all_relationships().await.len(), rels_before);
    }

    #[tokio::test]
    async fn test_edit_inside_one_section_touches_only_that_node() {
        let h = Harness::new().await;
        h.write("a.md", "one\n\ntwo\n\nthree\n\nfour\n\nfive\n");
        h.ingest("a.md").await;
        let before: BTreeMap<Uuid, GraphNode> = h
            .store
            .nodes_for_file("p", "a.md")
            .await
            .into_iter()
            .map(|n| (n.uuid, n))
            .collect();

        h.write("a.md", "one\n\ntwo\n\nTHREE\n\nfour\n\nfive\n");
        let stats = h.ingest("a.md").await;
        assert_eq!(stats.nodes_updated, 1);
        assert_eq!(stats.nodes_created, 0);
        assert_eq!(stats.nodes_deleted, 0);
        assert_eq!(stats.nodes_unchanged, 5);

        let after = h.store.nodes_for_file("p", "a.md").await;
        assert_eq!(after.len(), before.len());
        let changed: Vec<&GraphNode> = after
            .iter()
            .filter(|n| before[&n.uuid].properties != n.properties)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].text(props::CONTENT), Some("THREE"));
    }

    #[tokio::test]
    async fn test_removed_section_becomes_orphan() {
        let h = Harness::new().await;
        h.write("a.md", "one\n\ntwo\n\nthree\n");
        h.write("b.md", "other\n");
        h.ingest("a.md").await;
        h.ingest("b.md").await;
        let b_nodes = h.store.nodes_for_file("p", "b.md").await.len();

        h.write("a.md", "one\n\ntwo\n");
        let stats = h.ingest("a.md").await;
        assert_eq!(stats.nodes_deleted, 1);

        assert_eq!(h.store.nodes_for_file("p", "a.md").await.len(), 3);
        assert_eq!(h.store.nodes_for_file("p", "b.md").await.len(), b_nodes);
        let node_ids: HashSet<Uuid> = h
            .store
            .nodes_for_file("p", "a.md")
            .await
            .iter()
            .chain(h.store.nodes_for_file("p", "b.md").await.iter())
            .map(|n| n.uuid)
            .chain([file_node_uuid("p", "a.md"), file_node_uuid("p", "b.md")])
            .collect();
        for rel in h.store.all_relationships().await {
            assert!(node_ids.contains(&rel.from) && node_ids.contains(&rel.to));
        }
    }

    #[tokio::test]
    async fn test_deleted_file_removes_nodes_only_of_that_file() {
        let h = Harness::new().await;
        h.write("a.md", FIVE_BLOCKS);
        h.write("b.md", "keep me\n");
        h.ingest("a.md").await;
        h.ingest("b.md").await;
        let mut rx = h.events.subscribe();

        std::fs::remove_file(h.dir.path().join("a.md")).unwrap();
        let stats = h.manager.ingest_directory("p").await.unwrap();
        assert_eq!(stats.files_deleted, 1);
        assert_eq!(stats.nodes_deleted, 6);

        assert!(h.store.nodes_for_file("p", "a.md").await.is_empty());
        assert_eq!(h.store.nodes_for_file("p", "b.md").await.len(), 2);
        assert!(h
            .store
            .all_relationships()
            .await
            .iter()
            .all(|r| r.properties[props::SOURCE_FILE] == "b.md"));
        assert_eq!(h.record("a.md").await.state, FileState::Deleted);

        let mut saw_delete = false;
        while let Ok(event) = rx.try_recv() {
            if let GraphEvent::FileDeleted { path, nodes_removed, .. } = event {
                assert_eq!(path, "a.md");
                assert_eq!(nodes_removed, 6);
                saw_delete = true;
            }
        }
        assert!(saw_delete);
    }

    #[tokio::test]
    async fn test_deleted_file_can_come_back() {
        let h = Harness::new().await;
        h.write("a.md", "x\n");
        h.ingest("a.md").await;
        h.manager
            .delete_nodes_for_files("p", &["a.md".to_string()])
            .await
            .unwrap();
        assert_eq!(h.record("a.md").await.state, FileState::Deleted);

        let stats = h.ingest("a.md").await;
        assert_eq!(stats.files_processed, 1);
        assert_eq!(h.record("a.md").await.state, FileState::EmbeddingPending);
    }

    #[tokio::test]
    async fn test_parse_failure_is_isolated() {
        let h = Harness::new().await;
        h.write("good.md", "fine\n");
        std::fs::write(h.dir.path().join("bad.md"), [0xff, 0xfe, 0x00]).unwrap();

        let stats = h
            .manager
            .ingest(
                "p",
                vec![
                    ChangeEvent::new("good.md", ChangeType::Created),
                    ChangeEvent::new("bad.md", ChangeType::Created),
                ],
            )
            .await
            .unwrap();
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_details[0].path, "bad.md");
        assert_eq!(stats.error_details[0].kind, "parse_error");

        let bad = h.record("bad.md").await;
        assert_eq!(bad.state, FileState::Error);
        assert!(bad.last_error.as_deref().unwrap().starts_with("parse_error"));
        assert_eq!(bad.retry_count, 1);
        assert_eq!(h.record("good.md").await.state, FileState::EmbeddingPending);
    }

    #[tokio::test]
    async fn test_write_failure_then_retry() {
        let h = Harness::new().await;
        h.write("a.md", "x\n\ny\n");
        h.store.fail_next_commit.store(true, Ordering::SeqCst);

        let stats = h.ingest("a.md").await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_details[0].kind, "write_error");
        assert_eq!(h.store.derived_node_count().await, 0);
        assert_eq!(h.record("a.md").await.state, FileState::Error);

        let stats = h.manager.retry_failed(Some("p")).await.unwrap();
        assert_eq!(stats.files_processed, 1);
        let record = h.record("a.md").await;
        assert_eq!(record.state, FileState::EmbeddingPending);
        assert_eq!(record.retry_count, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_orphan_cleanup_failure_is_retried_next_cycle() {
        let h = Harness::new().await;
        h.write("a.md", "one\n\ntwo\n");
        h.ingest("a.md").await;

        let first_hash = h.record("a.md").await.content_hash;

        h.write("a.md", "one\n");
        h.store.fail_node_deletes.store(true, Ordering::SeqCst);
        let stats = h.ingest("a.md").await;
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.orphan_cleanup_failures, 1);
        assert_eq!(stats.nodes_updated + stats.nodes_unchanged, 2);
        let record = h.record("a.md").await;
        assert_eq!(record.pending_orphans.len(), 1);
        assert_ne!(record.state, FileState::Error);
        // the batch committed before the deletion failed
        assert!(record.content_hash.is_some());
        assert_ne!(record.content_hash, first_hash);
        assert_eq!(h.store.nodes_for_file("p", "a.md").await.len(), 3);

        // Same content: only the orphan deletion is retried
        h.store.fail_node_deletes.store(false, Ordering::SeqCst);
        let stats = h.ingest("a.md").await;
        assert_eq!(stats.nodes_deleted, 1);
        assert!(h.record("a.md").await.pending_orphans.is_empty());
        assert_eq!(h.store.nodes_for_file("p", "a.md").await.len(), 2);
    }

    struct BrokenAdapter;

    #[async_trait]
    impl SourceAdapter for BrokenAdapter {
        fn name(&self) -> &str {
            "broken"
        }
        fn supports(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "fn")
        }
        async fn parse(&self, _options: ParseOptions<'_>) -> Result<ParsedFragment> {
            Ok(ParsedFragment {
                // Function without a name
                nodes: vec![ParsedNode::new("Function", "f")],
                relationships: vec![ParsedRelationship::new(
                    NodeRef::local("Function", "f"),
                    NodeRef::local("Function", "missing"),
                    "CALLS",
                )],
            })
        }
    }

    #[tokio::test]
    async fn test_schema_violation_writes_nothing() {
        let mut h = Harness::new().await;
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(BrokenAdapter));
        h.manager = h.manager.with_adapters(adapters);
        h.write("x.fn", "whatever");

        let stats = h.ingest("x.fn").await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_details[0].kind, "schema_violation");
        assert_eq!(h.store.derived_node_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsupported_and_outside_paths_are_skipped() {
        let h = Harness::new().await;
        h.write("image.png", "not really");
        let stats = h
            .manager
            .ingest(
                "p",
                vec![
                    ChangeEvent::new(h.dir.path().join("image.png"), ChangeType::Created),
                    ChangeEvent::new("/definitely/elsewhere.md", ChangeType::Created),
                ],
            )
            .await
            .unwrap();
        assert_eq!(stats.files_skipped, 2);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_ingest_holds_ingestion_lock() {
        let h = Harness::new().await;
        h.write("a.md", "x\n");
        h.store.set_commit_delay(Duration::from_millis(80));
        let manager = Arc::new(h.manager);

        let task = {
            let manager = manager.clone();
            let path = h.dir.path().join("a.md");
            tokio::spawn(async move {
                manager
                    .ingest("p", vec![ChangeEvent::new(path, ChangeType::Created)])
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.locks.ingestion.is_locked());
        assert!(h
            .locks
            .ingestion
            .get_description()
            .unwrap()
            .contains("ingesting 1 files"));
        task.await.unwrap();
        assert!(!h.locks.ingestion.is_locked());
    }

    #[tokio::test]
    async fn test_change_sink_routes_by_project() {
        let h = Harness::new().await;
        h.write("a.md", "x\n");
        let stats = h
            .manager
            .process(vec![ChangeEvent::new(h.dir.path().join("a.md"), ChangeType::Created)])
            .await
            .unwrap();
        assert_eq!(stats.files_processed, 1);
        assert_eq!(h.record("a.md").await.project_id, "p");
    }

    #[tokio::test]
    async fn test_file_left_in_parsing_is_reingested() {
        let h = Harness::new().await;
        h.write("a.md", "alpha\n\nbeta\n");
        let mut abandoned = FileRecord::discovered("p", "a.md");
        abandoned.state = FileState::Parsing;
        h.store.upsert_file_record(&abandoned).await.unwrap();

        let stats = h.ingest("a.md").await;
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.files_processed, 1);
        let record = h.record("a.md").await;
        assert_eq!(record.state, FileState::EmbeddingPending);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn test_queue_drain_retries_earlier_failures() {
        let h = Harness::new().await;
        h.write("a.md", "alpha\n");
        h.store.fail_next_commit.store(true, Ordering::SeqCst);
        h.ingest("a.md").await;
        assert_eq!(h.record("a.md").await.state, FileState::Error);

        h.write("b.md", "beta\n");
        let stats = h
            .manager
            .process(vec![ChangeEvent::new(h.dir.path().join("b.md"), ChangeType::Created)])
            .await
            .unwrap();
        assert_eq!(stats.files_processed, 2);
        assert_eq!(stats.errors, 0);
        let a = h.record("a.md").await;
        assert_eq!(a.state, FileState::EmbeddingPending);
        assert_eq!(a.retry_count, 0);
        assert_eq!(h.record("b.md").await.state, FileState::EmbeddingPending);
    }

    #[tokio::test]
    async fn test_failure_in_a_drain_waits_for_the_next_cycle() {
        let h = Harness::new().await;
        h.write("a.md", "alpha\n");
        h.store.fail_next_commit.store(true, Ordering::SeqCst);
        let stats = h
            .manager
            .process(vec![ChangeEvent::new(h.dir.path().join("a.md"), ChangeType::Created)])
            .await
            .unwrap();
        assert_eq!(stats.errors, 1);
        let record = h.record("a.md").await;
        assert_eq!(record.state, FileState::Error);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_recovery_sweep_retries_stuck_and_failed_files() {
        let h = Harness::new().await;
        h.write("a.md", "alpha\n");
        h.write("b.md", "beta\n");
        h.store.fail_next_commit.store(true, Ordering::SeqCst);
        h.ingest("a.md").await;
        let mut stuck = FileRecord::discovered("p", "b.md");
        stuck.state = FileState::Parsing;
        stuck.state_changed_at = Utc::now() - chrono::Duration::hours(1);
        h.store.upsert_file_record(&stuck).await.unwrap();

        let manager = Arc::new(h.manager);
        let cancel = CancellationToken::new();
        let handle = manager
            .clone()
            .spawn_recovery_sweep(Duration::from_millis(10), cancel.clone());

        let mut settled = false;
        for _ in 0..100 {
            let a = h.store.get_file_record("p", "a.md").await.unwrap().unwrap();
            let b = h.store.get_file_record("p", "b.md").await.unwrap().unwrap();
            if a.state == FileState::EmbeddingPending && b.state == FileState::EmbeddingPending {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_files_are_not_retried() {
        let h = Harness::new().await;
        h.write("a.md", "alpha\n");
        let mut exhausted = FileRecord::discovered("p", "a.md");
        exhausted.state = FileState::Error;
        exhausted.retry_count = 3;
        exhausted.last_error = Some("write_error: x".into());
        h.store.upsert_file_record(&exhausted).await.unwrap();

        let stats = h.manager.retry_failed(None).await.unwrap();
        assert_eq!(stats.files_processed, 0);
        assert_eq!(h.record("a.md").await.state, FileState::Error);
    }
}
