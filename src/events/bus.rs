//! Event bus for broadcasting graph events to subscribers

use super::{EventEmitter, GraphEvent};
use tokio::sync::broadcast;
use tracing::debug;

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcasts `GraphEvent`s to every subscriber.
///
/// Emitting never blocks. Events sent while nobody listens are dropped, and a
/// subscriber that falls more than the capacity behind sees `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    /// Bus retaining at most `capacity` unread events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventEmitter for EventBus {
    fn emit(&self, event: GraphEvent) {
        let kind = event.kind();
        if let Ok(n) = self.sender.send(event) {
            debug!(kind = ?kind, subscribers = n, "GraphEvent emitted");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
