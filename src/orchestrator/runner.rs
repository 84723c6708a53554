//! Main orchestrator runner

use crate::edit::FileEditor;
use crate::embeddings::{EmbeddingProvider, EmbeddingService, HttpEmbeddingProvider};
use crate::events::{EventBus, GraphEvent};
use crate::explorer::RelationshipExplorer;
use crate::ingest::{
    ChangeEvent, ChangeSink, FileStateMachine, IngestionManager, IngestionProgress,
    IngestionQueue, IngestionStats,
};
use crate::locks::CoordinationLocks;
use crate::neo4j::models::{Project, ProjectType};
use crate::neo4j::{GraphStore, Neo4jClient};
use crate::projects::ProjectRegistry;
use crate::search::{SearchRequest, SearchResponse, SearchService};
use crate::Config;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Every component of the system, wired once at startup.
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn GraphStore>,
    events: EventBus,
    locks: Arc<CoordinationLocks>,
    projects: Arc<ProjectRegistry>,
    states: Arc<FileStateMachine>,
    manager: Arc<IngestionManager>,
    queue: Arc<IngestionQueue>,
    embeddings: Arc<EmbeddingService>,
    search: SearchService,
    explorer: Arc<RelationshipExplorer>,
    editor: FileEditor,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Connect to Neo4j and the embedding endpoint described by `config`.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let store = Neo4jClient::new(
            &config.neo4j.uri,
            &config.neo4j.user,
            &config.neo4j.password,
            config.embeddings.dimensions,
        )
        .await
        .context("Failed to connect to Neo4j")?;

        let provider = HttpEmbeddingProvider::from_config(&config.embeddings)?
            .map(|p| Arc::new(p) as Arc<dyn EmbeddingProvider>);
        match &provider {
            Some(p) => info!(model = %p.model_name(), "Embedding provider enabled"),
            None => info!("No embedding provider, search is lexical only"),
        }

        Self::build(config, Arc::new(store), provider).await
    }

    /// Wire the components over an existing store and provider.
    pub async fn build(
        config: Config,
        store: Arc<dyn GraphStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Arc<Self>> {
        let events = EventBus::default();
        let locks = Arc::new(CoordinationLocks::new(
            config.locks.wait_timeout(),
            config.locks.poll_interval(),
        ));

        let projects = Arc::new(ProjectRegistry::new(store.clone()));
        let loaded = projects.load().await.context("Failed to load projects")?;
        debug!("Project registry ready with {} projects", loaded);

        let states = Arc::new(FileStateMachine::new(
            store.clone(),
            events.clone(),
            config.ingestion.max_retries,
            config.ingestion.stuck_threshold(),
        ));
        let manager = Arc::new(
            IngestionManager::new(
                store.clone(),
                projects.clone(),
                states.clone(),
                locks.clone(),
                events.clone(),
            )
            .with_concurrency(config.ingestion.concurrency),
        );
        let queue = Arc::new(IngestionQueue::new(
            manager.clone() as Arc<dyn ChangeSink>,
            config.ingestion.debounce(),
            config.ingestion.max_batch_size,
        ));
        let embeddings = Arc::new(EmbeddingService::new(
            store.clone(),
            provider,
            locks.clone(),
            states.clone(),
            events.clone(),
            config.embeddings.batch_size,
        ));
        let explorer = Arc::new(RelationshipExplorer::new(store.clone()));
        let search = SearchService::new(
            store.clone(),
            projects.clone(),
            locks.clone(),
            embeddings.clone(),
            explorer.clone(),
            config.search.clone(),
        )
        .with_queue(queue.clone());
        let editor = FileEditor::new(events.clone()).with_queue(queue.clone());

        Ok(Arc::new(Self {
            config,
            store,
            events,
            locks,
            projects,
            states,
            manager,
            queue,
            embeddings,
            search,
            explorer,
            editor,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the recovery sweep, the embedding sweep and the subscriber that
    /// queues `FileModified` events whose publisher did not queue them.
    pub fn start_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }

        tasks.push(self.manager.clone().spawn_recovery_sweep(
            self.config.ingestion.recovery_interval(),
            self.cancel.clone(),
        ));
        if self.embeddings.has_provider() {
            tasks.push(self.embeddings.clone().spawn_sweep(
                self.config.embeddings.sweep_interval(),
                self.cancel.clone(),
            ));
        }

        let mut rx = self.events.subscribe();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(GraphEvent::FileModified { queued: true, .. }) => {}
                        Ok(GraphEvent::FileModified { path, change_type, .. }) => {
                            debug!(path = %path.display(), ?change_type, "File modified by tool");
                            queue.enqueue(ChangeEvent::new(path, change_type));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Event subscriber lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }));
        info!("Background tasks started");
    }

    /// Register `root` as a tracked project and ingest it.
    pub async fn track_project(&self, id: &str, root: &Path) -> Result<IngestionStats> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to canonicalize {}", root.display()))?;
        let project = self
            .projects
            .register(id, &root, ProjectType::TrackedProject)
            .await?;
        self.sync_project(&project).await
    }

    /// Ingest a directory once. The directory becomes a quick-ingest project
    /// unless a project is already rooted there.
    pub async fn sync_directory(&self, root: &Path) -> Result<IngestionStats> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to canonicalize {}", root.display()))?;
        let existing = self
            .projects
            .list()
            .into_iter()
            .find(|p| Path::new(&p.root_path) == root);
        let project = match existing {
            Some(project) => project,
            None => {
                let id = root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("root")
                    .to_string();
                self.projects
                    .register(id, &root, ProjectType::QuickIngest)
                    .await?
            }
        };
        self.sync_project(&project).await
    }

    async fn sync_project(&self, project: &Project) -> Result<IngestionStats> {
        info!(project_id = %project.id, root = %project.root_path, "Syncing project");
        let stats = self.manager.ingest_directory(&project.id).await?;
        info!(
            project_id = %project.id,
            processed = stats.files_processed,
            skipped = stats.files_skipped,
            errors = stats.errors,
            "Project synced"
        );
        Ok(stats)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.search.search(request).await
    }

    pub async fn progress(&self, project_id: Option<&str>) -> Result<IngestionProgress> {
        self.states.get_progress(project_id).await
    }

    /// Stop background tasks and drain the queue.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.shutdown().await;
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Orchestrator stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn locks(&self) -> &Arc<CoordinationLocks> {
        &self.locks
    }

    pub fn projects(&self) -> &Arc<ProjectRegistry> {
        &self.projects
    }

    pub fn states(&self) -> &Arc<FileStateMachine> {
        &self.states
    }

    pub fn manager(&self) -> &Arc<IngestionManager> {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<IngestionQueue> {
        &self.queue
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn search_service(&self) -> &SearchService {
        &self.search
    }

    pub fn explorer(&self) -> &Arc<RelationshipExplorer> {
        &self.explorer
    }

    pub fn editor(&self) -> &FileEditor {
        &self.editor
    }
}
