//! Ingestion queue
//!
//! Coalesces change events per path and hands them to a [`ChangeSink`] after
//! a quiet period. Uses an mpsc channel + timeout loop:
//! 1. `enqueue` merges the event into the pending map and pings the loop
//! 2. the loop waits for the first ping, then keeps consuming pings until
//!    `debounce` of silence, a flush request, or a full batch
//! 3. pending events are moved to the in-flight set and processed; drains are
//!    sequential, concurrency happens inside the sink
//!
//! Coalescing rules for a path that already has a pending event:
//! - `deleted` replaces whatever was pending
//! - `created`/`updated` after a pending `deleted` becomes `updated`
//! - `updated` after a pending `created` stays `created`
//! - otherwise the newest event wins

use super::manager::IngestionStats;
use crate::locks::PendingWork;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// A change to one file, as reported by the watcher or an edit tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            change_type,
            timestamp: Utc::now(),
        }
    }
}

/// Merge an incoming change with the one already pending for the same path.
pub fn coalesce(pending: Option<ChangeType>, incoming: ChangeType) -> ChangeType {
    use ChangeType::*;
    match (pending, incoming) {
        (_, Deleted) => Deleted,
        (Some(Deleted), _) => Updated,
        (Some(Created), Updated) => Created,
        (_, change) => change,
    }
}

/// Where drained events go.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn process(&self, events: Vec<ChangeEvent>) -> Result<IngestionStats>;
}

enum Command {
    Enqueued,
    Flush(oneshot::Sender<IngestionStats>),
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<PathBuf, ChangeEvent>,
    /// Events taken by the current drain and not finished yet
    queued: usize,
    processing: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    sink: Arc<dyn ChangeSink>,
    max_batch_size: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Process everything pending, `max_batch_size` events at a time.
    async fn drain(&self) -> IngestionStats {
        let mut total = IngestionStats::default();
        loop {
            let batch: Vec<ChangeEvent> = {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    state.processing = false;
                    state.queued = 0;
                    break;
                }
                let mut events: Vec<ChangeEvent> = state.pending.drain().map(|(_, e)| e).collect();
                events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.path.cmp(&b.path)));
                if events.len() > self.max_batch_size {
                    for event in events.split_off(self.max_batch_size) {
                        state.pending.insert(event.path.clone(), event);
                    }
                }
                state.processing = true;
                state.queued = events.len();
                events
            };

            let count = batch.len();
            let start = Instant::now();
            match self.sink.process(batch).await {
                Ok(stats) => {
                    debug!(
                        events = count,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Queue batch drained"
                    );
                    total.merge(stats);
                }
                Err(e) => {
                    warn!(events = count, "Queue batch failed: {:#}", e);
                    total.errors += count;
                }
            }
        }
        total
    }
}

/// Debounced, coalescing front door of the ingestion manager.
pub struct IngestionQueue {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionQueue {
    /// Create the queue and spawn its drain loop, which runs until
    /// [`shutdown`](Self::shutdown).
    pub fn new(sink: Arc<dyn ChangeSink>, debounce: Duration, max_batch_size: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            sink,
            max_batch_size: max_batch_size.max(1),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Self::run_loop(shared.clone(), rx, debounce, cancel.clone()));
        Self {
            shared,
            commands: tx,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Add an event. Non-blocking.
    pub fn enqueue(&self, event: ChangeEvent) {
        {
            let mut state = self.shared.lock();
            let previous = state.pending.get(&event.path).map(|e| e.change_type);
            let change_type = coalesce(previous, event.change_type);
            debug!(path = %event.path.display(), ?previous, ?change_type, "Enqueued change");
            state.pending.insert(
                event.path.clone(),
                ChangeEvent {
                    change_type,
                    ..event
                },
            );
        }
        let _ = self.commands.send(Command::Enqueued);
    }

    pub fn enqueue_many(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.enqueue(event);
        }
    }

    /// Drain now, ignoring the debounce window, and wait for the drain to
    /// finish. Returns the stats of everything drained on behalf of this call.
    pub async fn flush(&self) -> IngestionStats {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).is_err() {
            return IngestionStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Events waiting for the next drain
    pub fn get_pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Events taken by the drain in progress
    pub fn get_queued_count(&self) -> usize {
        self.shared.lock().queued
    }

    pub fn is_processing(&self) -> bool {
        self.shared.lock().processing
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.shared.lock().pending.contains_key(path)
    }

    /// Wait until nothing is pending and no drain runs. Returns `false` on
    /// timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            {
                let state = self.shared.lock();
                if state.pending.is_empty() && !state.processing {
                    return true;
                }
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop the drain loop after a final drain of what is pending.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Ingestion queue worker ended abnormally: {}", e);
            }
        }
    }

    async fn run_loop(
        shared: Arc<Shared>,
        mut rx: mpsc::UnboundedReceiver<Command>,
        debounce: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => None,
                cmd = rx.recv() => cmd,
            };
            let Some(first) = first else {
                break;
            };

            let mut waiters = Vec::new();
            if let Command::Flush(tx) = first {
                waiters.push(tx);
            } else {
                loop {
                    if shared.lock().pending.len() >= shared.max_batch_size {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = tokio::time::timeout(debounce, rx.recv()) => match next {
                            Ok(Some(Command::Enqueued)) => continue,
                            Ok(Some(Command::Flush(tx))) => {
                                waiters.push(tx);
                                break;
                            }
                            // channel closed or quiet period elapsed
                            Ok(None) | Err(_) => break,
                        },
                    }
                }
            }

            let stats = shared.drain().await;
            for waiter in waiters {
                let _ = waiter.send(stats.clone());
            }
        }

        // Final drain so accepted events are not lost on shutdown
        let stats = shared.drain().await;
        while let Ok(cmd) = rx.try_recv() {
            if let Command::Flush(tx) = cmd {
                let _ = tx.send(stats.clone());
            }
        }
        debug!("Ingestion queue stopped");
    }
}

impl PendingWork for IngestionQueue {
    fn pending_count(&self) -> usize {
        self.get_pending_count()
    }

    fn is_processing(&self) -> bool {
        IngestionQueue::is_processing(self)
    }
}

impl Drop for IngestionQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
