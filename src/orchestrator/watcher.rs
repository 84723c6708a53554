//! File watcher feeding the ingestion queue
//!
//! Filesystem events are mapped to `ChangeEvent`s and enqueued; the queue
//! debounces and coalesces them before ingestion.

use crate::ingest::manager::IGNORED_DIRS;
use crate::ingest::{AdapterRegistry, ChangeEvent, ChangeType, IngestionQueue};
use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Watches directories and enqueues changes of supported files
pub struct FileWatcher {
    queue: Arc<IngestionQueue>,
    adapters: AdapterRegistry,
    watched_paths: Arc<RwLock<HashSet<PathBuf>>>,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl FileWatcher {
    pub fn new(queue: Arc<IngestionQueue>, adapters: AdapterRegistry) -> Self {
        Self {
            queue,
            adapters,
            watched_paths: Arc::new(RwLock::new(HashSet::new())),
            stop_tx: None,
        }
    }

    /// Add a directory. Takes effect on the next [`start`](Self::start).
    pub async fn watch(&mut self, path: &Path) -> Result<()> {
        let path = path.canonicalize().context("Failed to canonicalize path")?;

        let mut watched = self.watched_paths.write().await;
        if watched.insert(path.clone()) {
            tracing::info!("Now watching: {}", path.display());
        }
        Ok(())
    }

    /// Start the watcher background task
    pub async fn start(&mut self) -> Result<()> {
        if self.stop_tx.is_some() {
            return Ok(());
        }

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => tracing::warn!("Watch error: {}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .context("Failed to create watcher")?;

        for path in self.watched_paths.read().await.iter() {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .with_context(|| format!("Failed to watch {}", path.display()))?;
        }

        self.stop_tx = Some(stop_tx);
        let queue = self.queue.clone();
        let adapters = self.adapters.clone();

        tokio::spawn(async move {
            // dropping the watcher stops notifications
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("File watcher stopping");
                        break;
                    }
                    Some(event) = event_rx.recv() => {
                        let changes = map_event(&event, &adapters);
                        for change in &changes {
                            tracing::debug!(
                                path = %change.path.display(),
                                change_type = ?change.change_type,
                                "File changed"
                            );
                        }
                        queue.enqueue_many(changes);
                    }
                }
            }
        });

        tracing::info!("File watcher started");
        Ok(())
    }

    /// Stop the watcher
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Get currently watched paths
    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_paths.read().await.iter().cloned().collect()
    }
}

/// Translate one notify event into change events for supported files.
fn map_event(event: &Event, adapters: &AdapterRegistry) -> Vec<ChangeEvent> {
    let change_type = match event.kind {
        EventKind::Create(_) => ChangeType::Created,
        EventKind::Remove(_) => ChangeType::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeType::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeType::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths are [from, to]
            let mut changes = Vec::new();
            if let [from, to] = event.paths.as_slice() {
                if should_sync_file(from, adapters) {
                    changes.push(ChangeEvent::new(from.clone(), ChangeType::Deleted));
                }
                if should_sync_file(to, adapters) {
                    changes.push(ChangeEvent::new(to.clone(), ChangeType::Created));
                }
            }
            return changes;
        }
        EventKind::Modify(_) => ChangeType::Updated,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|p| should_sync_file(p, adapters))
        .map(|p| ChangeEvent::new(p.clone(), change_type))
        .collect()
}

/// Check if a file should be synced based on its adapter and path
fn should_sync_file(path: &Path, adapters: &AdapterRegistry) -> bool {
    if !adapters.supports(path) {
        return false;
    }
    !path.components().any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(|n| IGNORED_DIRS.contains(&n)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ChangeSink, IngestionStats};
    use async_trait::async_trait;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};
    use std::sync::Mutex;

    fn adapters() -> AdapterRegistry {
        AdapterRegistry::with_defaults()
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn test_should_sync_supported_files() {
        assert!(should_sync_file(Path::new("/project/README.md"), &adapters()));
        assert!(should_sync_file(Path::new("/project/docs/notes.txt"), &adapters()));
    }

    #[test]
    fn test_should_not_sync_unsupported_extensions() {
        assert!(!should_sync_file(Path::new("/project/image.png"), &adapters()));
        assert!(!should_sync_file(Path::new("/project/Makefile"), &adapters()));
    }

    #[test]
    fn test_should_not_sync_ignored_directories() {
        let adapters = adapters();
        assert!(!should_sync_file(Path::new("/project/node_modules/pkg/README.md"), &adapters));
        assert!(!should_sync_file(Path::new("/project/.git/COMMIT_EDITMSG.md"), &adapters));
        assert!(!should_sync_file(Path::new("/project/target/doc/index.md"), &adapters));
        // a name merely containing an ignored dir is fine
        assert!(should_sync_file(Path::new("/project/targets/plan.md"), &adapters));
    }

    #[test]
    fn test_map_event_kinds() {
        let adapters = adapters();
        let created = map_event(
            &event(EventKind::Create(CreateKind::File), &["/p/a.md"]),
            &adapters,
        );
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].change_type, ChangeType::Created);

        let modified = map_event(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/p/a.md", "/p/logo.png"],
            ),
            &adapters,
        );
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].change_type, ChangeType::Updated);

        let removed = map_event(
            &event(EventKind::Remove(RemoveKind::File), &["/p/a.md"]),
            &adapters,
        );
        assert_eq!(removed[0].change_type, ChangeType::Deleted);

        let access = map_event(
            &event(EventKind::Access(AccessKind::Any), &["/p/a.md"]),
            &adapters,
        );
        assert!(access.is_empty());
    }

    #[test]
    fn test_map_rename_both() {
        let changes = map_event(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/p/old.md", "/p/new.md"],
            ),
            &adapters(),
        );
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path, PathBuf::from("/p/old.md"));
        assert_eq!(changes[0].change_type, ChangeType::Deleted);
        assert_eq!(changes[1].path, PathBuf::from("/p/new.md"));
        assert_eq!(changes[1].change_type, ChangeType::Created);
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeSink for RecordingSink {
        async fn process(&self, events: Vec<ChangeEvent>) -> anyhow::Result<IngestionStats> {
            self.events.lock().unwrap().extend(events);
            Ok(IngestionStats::default())
        }
    }

    #[tokio::test]
    async fn test_watch_registers_paths_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let queue = Arc::new(IngestionQueue::new(sink, Duration::from_millis(10), 10));
        let mut watcher = FileWatcher::new(queue.clone(), adapters());

        watcher.watch(dir.path()).await.unwrap();
        watcher.watch(dir.path()).await.unwrap();
        assert_eq!(watcher.watched_paths().await, vec![dir.path().canonicalize().unwrap()]);
        assert!(watcher.watch(&dir.path().join("missing")).await.is_err());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let queue = Arc::new(IngestionQueue::new(sink, Duration::from_millis(10), 10));
        let mut watcher = FileWatcher::new(queue.clone(), adapters());
        watcher.watch(dir.path()).await.unwrap();

        watcher.start().await.unwrap();
        // second start is a no-op
        watcher.start().await.unwrap();
        watcher.stop().await;
        queue.shutdown().await;
    }
}
