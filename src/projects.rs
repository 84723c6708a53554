//! Project registry
//!
//! Maps absolute file paths to the project that owns them. A path belongs to
//! the registered project with the longest matching root; paths outside every
//! root fall into an `orphan-file` project rooted at the file's directory.

use crate::neo4j::models::{Project, ProjectType};
use crate::neo4j::traits::GraphStore;
use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Id of the orphan-file project for a directory
pub fn orphan_project_id(dir: &Path) -> String {
    format!("orphan:{}", dir.display())
}

pub struct ProjectRegistry {
    store: Arc<dyn GraphStore>,
    projects: DashMap<String, Project>,
}

impl ProjectRegistry {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            projects: DashMap::new(),
        }
    }

    /// Load the projects persisted in the graph. Returns how many were loaded.
    pub async fn load(&self) -> Result<usize> {
        let projects = self.store.list_projects().await?;
        let count = projects.len();
        for project in projects {
            self.projects.insert(project.id.clone(), project);
        }
        debug!("Loaded {} projects", count);
        Ok(count)
    }

    /// Register (or re-register) a project rooted at `root`. An existing
    /// project keeps its `excluded` flag and `last_accessed`.
    pub async fn register(
        &self,
        id: impl Into<String>,
        root: &Path,
        project_type: ProjectType,
    ) -> Result<Project> {
        let id = id.into();
        let root_path = root
            .to_str()
            .with_context(|| format!("project root is not valid UTF-8: {}", root.display()))?
            .trim_end_matches('/')
            .to_string();
        let root_path = if root_path.is_empty() {
            "/".to_string()
        } else {
            root_path
        };

        let previous = self.get(&id);
        let project = Project {
            id: id.clone(),
            root_path,
            project_type,
            excluded: previous.as_ref().is_some_and(|p| p.excluded),
            last_accessed: previous.and_then(|p| p.last_accessed),
        };
        self.store.upsert_project(&project).await?;
        self.projects.insert(id, project.clone());
        info!(project_id = %project.id, root = %project.root_path, "Project registered");
        Ok(project)
    }

    pub fn get(&self, id: &str) -> Option<Project> {
        self.projects.get(id).map(|p| p.value().clone())
    }

    /// All projects, sorted by id
    pub fn list(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.iter().map(|p| p.value().clone()).collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    /// Ids of every project search may read
    pub fn searchable_ids(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(|p| !p.excluded)
            .map(|p| p.id)
            .collect()
    }

    /// Exclude a project from ingestion and search, or include it again.
    pub async fn exclude(&self, id: &str, excluded: bool) -> Result<()> {
        let project = {
            let mut entry = self
                .projects
                .get_mut(id)
                .with_context(|| format!("unknown project: {}", id))?;
            entry.excluded = excluded;
            entry.value().clone()
        };
        self.store.upsert_project(&project).await
    }

    /// Record that the given projects were just read.
    pub async fn touch(&self, ids: &[String]) -> Result<()> {
        let now = Utc::now();
        for id in ids {
            if let Some(mut entry) = self.projects.get_mut(id) {
                entry.last_accessed = Some(now);
            }
            self.store.touch_project(id).await?;
        }
        Ok(())
    }

    /// Find the project owning `path` and the path relative to its root.
    ///
    /// Returns `None` when the owning project is excluded. A path outside
    /// every project registers an orphan-file project for its directory.
    pub async fn resolve(&self, path: &Path) -> Result<Option<(Project, String)>> {
        let owner = self
            .projects
            .iter()
            .filter(|p| path.starts_with(&p.root_path))
            // orphan-file projects own only their directory's direct children
            .filter(|p| {
                p.project_type != ProjectType::OrphanFile
                    || path.parent() == Some(Path::new(&p.root_path))
            })
            .max_by_key(|p| Path::new(&p.root_path).components().count())
            .map(|p| p.value().clone());

        let project = match owner {
            Some(project) => project,
            None => {
                let dir = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/"));
                self.register(orphan_project_id(&dir), &dir, ProjectType::OrphanFile)
                    .await?
            }
        };
        if project.excluded {
            debug!(project_id = %project.id, path = %path.display(), "Path belongs to excluded project");
            return Ok(None);
        }

        let relative = path
            .strip_prefix(&project.root_path)
            .with_context(|| format!("{} is outside {}", path.display(), project.root_path))?;
        let relative = crate::ingest::identity::normalize_relative_path(relative);
        Ok(Some((project, relative)))
    }

    /// Absolute path of a project-relative path
    pub fn absolute_path(project: &Project, relative: &str) -> PathBuf {
        Path::new(&project.root_path).join(relative)
    }
}
