//! Orchestrator module wiring the components together

pub mod runner;
pub mod watcher;

pub use runner::Orchestrator;
pub use watcher::FileWatcher;
