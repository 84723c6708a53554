//! Integration tests for knowledge-sync
//!
//! These tests require Neo4j to be running.
//! Run with: cargo test --test integration_tests

use knowledge_sync::embeddings::{EmbeddingProvider, MockEmbeddingProvider};
use knowledge_sync::explorer::ExploreOptions;
use knowledge_sync::neo4j::models::{Direction, FileState, NodeFilter};
use knowledge_sync::neo4j::{GraphStore, Neo4jClient};
use knowledge_sync::orchestrator::Orchestrator;
use knowledge_sync::search::{SearchMode, SearchRequest};
use knowledge_sync::Config;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Get test configuration from environment or use defaults
fn test_config() -> Config {
    let mut config = Config::default();
    config.neo4j.uri = std::env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".into());
    config.neo4j.user = std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".into());
    config.neo4j.password =
        std::env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "knowledge-sync".into());
    config.ingestion.debounce_ms = 20;
    config.locks.wait_timeout_ms = 10_000;
    config.locks.poll_interval_ms = 10;
    config
}

/// Check if Neo4j is available
async fn backends_available() -> bool {
    let config = test_config();

    let neo4j_ok = match neo4rs::Graph::new(
        &config.neo4j.uri,
        &config.neo4j.user,
        &config.neo4j.password,
    )
    .await
    {
        Ok(graph) => graph.run(neo4rs::query("RETURN 1")).await.is_ok(),
        Err(_) => false,
    };

    if !neo4j_ok {
        eprintln!("Neo4j not available at {}", config.neo4j.uri);
    }
    neo4j_ok
}

async fn orchestrator(provider: Option<Arc<dyn EmbeddingProvider>>) -> Arc<Orchestrator> {
    let config = test_config();
    let store = Neo4jClient::new(
        &config.neo4j.uri,
        &config.neo4j.user,
        &config.neo4j.password,
        config.embeddings.dimensions,
    )
    .await
    .expect("Neo4j client");
    Orchestrator::build(config, Arc::new(store), provider)
        .await
        .expect("orchestrator")
}

/// A project id no other test run uses
fn unique_project() -> String {
    format!("it-{}", Uuid::new_v4())
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

async fn cleanup(orchestrator: &Orchestrator, project_id: &str) {
    let records = orchestrator
        .store()
        .list_file_records(Some(project_id), None)
        .await
        .unwrap_or_default();
    let paths: Vec<String> = records.into_iter().map(|r| r.path).collect();
    let _ = orchestrator
        .manager()
        .delete_nodes_for_files(project_id, &paths)
        .await;
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_ingest_then_lexical_search() {
    if !backends_available().await {
        eprintln!("Skipping test: backends not available");
        return;
    }

    let dir = TempDir::new().unwrap();
    write(dir.path(), "guide.md", "# Guide\n\nThe config loader reads yaml files\n");
    write(dir.path(), "notes.txt", "unrelated shopping list\n");
    let project = unique_project();
    let orchestrator = orchestrator(None).await;

    let stats = orchestrator.track_project(&project, dir.path()).await.unwrap();
    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.errors, 0);

    let response = orchestrator
        .search(
            &SearchRequest::new("config loadr")
                .mode(SearchMode::Lexical)
                .filter(NodeFilter::for_projects(vec![project.clone()])),
        )
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert_eq!(
        response.results[0].node.text("file_path"),
        Some("guide.md")
    );

    // unchanged content is skipped on the next sync
    let again = orchestrator.track_project(&project, dir.path()).await.unwrap();
    assert_eq!(again.files_skipped, 2);
    assert_eq!(again.nodes_created + again.nodes_updated, 0);

    cleanup(&orchestrator, &project).await;
}

#[tokio::test]
async fn test_update_and_delete_are_reflected() {
    if !backends_available().await {
        eprintln!("Skipping test: backends not available");
        return;
    }

    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.md", "first block\n\nsecond block\n");
    let project = unique_project();
    let orchestrator = orchestrator(None).await;
    orchestrator.track_project(&project, dir.path()).await.unwrap();

    write(dir.path(), "a.md", "first block\n\nreplaced block\n");
    let stats = orchestrator.track_project(&project, dir.path()).await.unwrap();
    assert_eq!(stats.files_processed, 1);
    assert!(stats.nodes_updated >= 1);
    assert!(stats.nodes_unchanged >= 1);

    let filter = NodeFilter::for_projects(vec![project.clone()]);
    let stale = orchestrator
        .search(
            &SearchRequest::new("second")
                .mode(SearchMode::Lexical)
                .filter(filter.clone()),
        )
        .await
        .unwrap();
    assert!(stale.results.is_empty());

    std::fs::remove_file(dir.path().join("a.md")).unwrap();
    let stats = orchestrator.track_project(&project, dir.path()).await.unwrap();
    assert_eq!(stats.files_deleted, 1);
    let record = orchestrator
        .store()
        .get_file_record(&project, "a.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, FileState::Deleted);

    let gone = orchestrator
        .search(&SearchRequest::new("first").mode(SearchMode::Lexical).filter(filter))
        .await
        .unwrap();
    assert!(gone.results.is_empty());

    cleanup(&orchestrator, &project).await;
}

#[tokio::test]
async fn test_hybrid_search_embeds_lazily() {
    if !backends_available().await {
        eprintln!("Skipping test: backends not available");
        return;
    }

    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "a.md",
        "parser turns tokens into trees\n\nwriter flushes buffers to disk\n",
    );
    let project = unique_project();
    let dims = test_config().embeddings.dimensions;
    let provider = Arc::new(MockEmbeddingProvider::new(dims)) as Arc<dyn EmbeddingProvider>;
    let orchestrator = orchestrator(Some(provider)).await;
    orchestrator.track_project(&project, dir.path()).await.unwrap();

    let response = orchestrator
        .search(
            &SearchRequest::new("parser tokens")
                .mode(SearchMode::Hybrid)
                .filter(NodeFilter::for_projects(vec![project.clone()])),
        )
        .await
        .unwrap();
    assert!(!response.results.is_empty());
    assert!(response.results[0]
        .node
        .text("content")
        .is_some_and(|c| c.contains("parser")));

    let progress = orchestrator.progress(Some(&project)).await.unwrap();
    assert_eq!(progress.count(FileState::Embedded), 1);

    cleanup(&orchestrator, &project).await;
}

#[tokio::test]
async fn test_search_results_with_exploration() {
    if !backends_available().await {
        eprintln!("Skipping test: backends not available");
        return;
    }

    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.md", "intro paragraph\n\nmiddle paragraph\n\nclosing words\n");
    let project = unique_project();
    let orchestrator = orchestrator(None).await;
    orchestrator.track_project(&project, dir.path()).await.unwrap();

    let response = orchestrator
        .search(
            &SearchRequest::new("middle")
                .mode(SearchMode::Lexical)
                .filter(NodeFilter::for_projects(vec![project.clone()]))
                .explore(ExploreOptions::new(1, Direction::Both)),
        )
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    let context = response.results[0].context.as_ref().unwrap();
    assert!(context.group("NEXT", Direction::Outgoing).is_some());
    assert!(context.group("NEXT", Direction::Incoming).is_some());
    assert!(context.group("CONTAINS", Direction::Incoming).is_some());

    cleanup(&orchestrator, &project).await;
}
