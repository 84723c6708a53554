//! Graph event types

use crate::ingest::ChangeType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Discriminant of a [`GraphEvent`], for filtering and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphEventKind {
    FileModified,
    FileIngested,
    FileDeleted,
    FileFailed,
    BatchCompleted,
    EmbeddingsUpdated,
    StuckFilesReset,
}

/// An event emitted by the core after something observable happened.
///
/// Must be Clone for `tokio::sync::broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// A file was changed on disk by a tool call (not by the watcher)
    FileModified {
        path: PathBuf,
        change_type: ChangeType,
        timestamp: DateTime<Utc>,
        /// The publisher already handed the change to the ingestion queue
        #[serde(default)]
        queued: bool,
    },
    /// A file's nodes were written
    FileIngested {
        project_id: String,
        path: String,
        created: usize,
        updated: usize,
        deleted: usize,
    },
    /// A file's nodes were removed
    FileDeleted {
        project_id: String,
        path: String,
        nodes_removed: usize,
    },
    /// Ingesting a file failed; the file is in the `error` state
    FileFailed {
        project_id: String,
        path: String,
        kind: String,
        message: String,
    },
    /// One `ingest` call finished
    BatchCompleted {
        project_id: String,
        files_processed: usize,
        files_skipped: usize,
        errors: usize,
        duration_ms: u64,
    },
    /// Dirty nodes received fresh embeddings
    EmbeddingsUpdated {
        nodes: usize,
        files_completed: usize,
    },
    /// The recovery sweep reset abandoned files
    StuckFilesReset { paths: Vec<String> },
}

impl GraphEvent {
    pub fn kind(&self) -> GraphEventKind {
        match self {
            Self::FileModified { .. } => GraphEventKind::FileModified,
            Self::FileIngested { .. } => GraphEventKind::FileIngested,
            Self::FileDeleted { .. } => GraphEventKind::FileDeleted,
            Self::FileFailed { .. } => GraphEventKind::FileFailed,
            Self::BatchCompleted { .. } => GraphEventKind::BatchCompleted,
            Self::EmbeddingsUpdated { .. } => GraphEventKind::EmbeddingsUpdated,
            Self::StuckFilesReset { .. } => GraphEventKind::StuckFilesReset,
        }
    }

    pub fn file_modified(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self::FileModified {
            path: path.into(),
            change_type,
            timestamp: Utc::now(),
            queued: false,
        }
    }

    /// Mark a `FileModified` event as already queued for ingestion.
    pub fn already_queued(mut self) -> Self {
        if let Self::FileModified { queued, .. } = &mut self {
            *queued = true;
        }
        self
    }
}

/// Anything that can publish graph events.
///
/// Emitting never blocks and never fails.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: GraphEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = GraphEvent::FileDeleted {
            project_id: "p".into(),
            path: "a.md".into(),
            nodes_removed: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_deleted");
        assert_eq!(json["nodes_removed"], 3);

        let back: GraphEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_matches_variant() {
        let event = GraphEvent::file_modified("/tmp/a.md", ChangeType::Updated);
        assert_eq!(event.kind(), GraphEventKind::FileModified);
        let event = GraphEvent::StuckFilesReset { paths: vec![] };
        assert_eq!(event.kind(), GraphEventKind::StuckFilesReset);
    }

    #[test]
    fn test_file_modified_queued_flag() {
        let plain = GraphEvent::file_modified("/tmp/a.md", ChangeType::Updated);
        assert!(matches!(plain, GraphEvent::FileModified { queued: false, .. }));
        let queued = plain.already_queued();
        assert!(matches!(queued, GraphEvent::FileModified { queued: true, .. }));

        // events from older publishers carry no flag
        let json = serde_json::json!({
            "type": "file_modified",
            "path": "/tmp/a.md",
            "change_type": "updated",
            "timestamp": "2024-01-01T00:00:00Z",
        });
        let back: GraphEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, GraphEvent::FileModified { queued: false, .. }));
    }
}
