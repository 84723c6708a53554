//! Incremental ingestion pipeline
//!
//! - `adapter`: `SourceAdapter` trait turning file content into graph fragments
//! - `identity`: deterministic node uuids
//! - `schema`: per-label validation of parsed nodes
//! - `diff`: file and node level change detection
//! - `state`: file lifecycle state machine and stuck-file recovery
//! - `manager`: diff -> parse -> upsert -> orphan cleanup -> state update
//! - `queue`: debounced, coalescing front door of the manager

pub mod adapter;
pub mod diff;
pub mod identity;
pub mod manager;
pub mod queue;
pub mod schema;
pub mod state;

pub use adapter::{
    AdapterRegistry, NodeRef, ParseOptions, ParsedFragment, ParsedNode, ParsedRelationship,
    SourceAdapter, TextBlockAdapter,
};
pub use diff::{ContentDiffEngine, FileChange, FileCheck, NodeDiff};
pub use manager::{FileError, IngestionManager, IngestionStats};
pub use queue::{ChangeEvent, ChangeSink, ChangeType, IngestionQueue};
pub use schema::{NodeKind, SchemaRegistry};
pub use state::{FileStateMachine, IngestionProgress};
