//! Graph event system
//!
//! This module provides:
//! - `GraphEvent`: typed events emitted by ingestion, embedding and editing
//! - `EventBus`: broadcast channel distributing events to subscribers
//!
//! The core never calls its consumers directly: re-ingestion triggers and
//! notifications subscribe to the bus.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{EventEmitter, GraphEvent, GraphEventKind};
