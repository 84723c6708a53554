//! Knowledge Sync - CLI
//!
//! Keeps a Neo4j knowledge graph in step with a set of directories.

use anyhow::Result;
use clap::{Parser, Subcommand};
use knowledge_sync::orchestrator::{FileWatcher, Orchestrator};
use knowledge_sync::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "knowledge-sync")]
#[command(about = "Incremental knowledge-graph ingestion with hybrid search")]
struct Cli {
    /// YAML config file (defaults to ./config.yaml when present)
    #[arg(short, long, env = "KNOWLEDGE_SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track directories and keep the graph in sync until Ctrl-C
    Watch {
        /// Directories to track
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },

    /// Ingest a directory once and print the stats
    Sync {
        /// Directory path to sync
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,knowledge_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { dirs } => run_watch(config, &dirs).await,
        Commands::Sync { dir } => run_sync(config, &dir).await,
    }
}

async fn run_watch(config: Config, dirs: &[PathBuf]) -> Result<()> {
    let orchestrator = Orchestrator::connect(config).await?;
    tracing::info!("Connected to Neo4j");

    let mut watcher = FileWatcher::new(
        orchestrator.queue().clone(),
        orchestrator.manager().adapters().clone(),
    );
    for dir in dirs {
        let id = project_id(dir);
        let stats = orchestrator.track_project(&id, dir).await?;
        tracing::info!(
            "Initial sync of {}: {} files processed, {} skipped, {} errors",
            id,
            stats.files_processed,
            stats.files_skipped,
            stats.errors
        );
        watcher.watch(dir).await?;
    }

    orchestrator.start_background();
    watcher.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    watcher.stop().await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn run_sync(config: Config, dir: &Path) -> Result<()> {
    tracing::info!("Syncing directory: {}", dir.display());

    let orchestrator = Orchestrator::connect(config).await?;
    tracing::info!("Connected to Neo4j");

    let result = orchestrator.sync_directory(dir).await?;
    // embed what the sync produced when a provider is configured
    if orchestrator.embeddings().has_provider() {
        let pass = orchestrator.embeddings().embed_dirty(None).await?;
        tracing::info!(
            "Embedded {} nodes, {} files completed",
            pass.nodes_embedded,
            pass.files_completed.len()
        );
    }
    orchestrator.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    for error in &result.error_details {
        tracing::warn!("{}: {}", error.path, error.message);
    }
    Ok(())
}

/// Project id of a watched directory: its final path component
fn project_id(dir: &Path) -> String {
    dir.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| dir.display().to_string())
}
