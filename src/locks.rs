//! Coordination locks
//!
//! Two independent, single-holder, non-reentrant locks arbitrate between
//! writers and readers of the graph:
//! - the ingestion lock is held for every graph-mutating ingestion batch
//! - the embedding lock is held while vectors are being generated
//!
//! Readers never take the locks; they wait for them to be free with a bound
//! and proceed anyway on timeout, reporting possibly stale results.

use crate::error::CoreError;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// A named cooperative lock with an observable holder description.
pub struct CoordinationLock {
    name: &'static str,
    mutex: Arc<Mutex<()>>,
    holder: Arc<watch::Sender<Option<String>>>,
}

/// Held lock. Dropping it (or calling [`LockGuard::release`]) frees the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    name: &'static str,
    holder: Arc<watch::Sender<Option<String>>>,
    started: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    /// Release the lock explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Clear the description before the mutex guard field is dropped, so a
        // new holder's description is never overwritten.
        self.holder.send_replace(None);
        debug!(
            lock = self.name,
            held_ms = self.started.elapsed().as_millis() as u64,
            "Lock released"
        );
    }
}

impl CoordinationLock {
    pub fn new(name: &'static str) -> Self {
        let (holder, _) = watch::channel(None);
        Self {
            name,
            mutex: Arc::new(Mutex::new(())),
            holder: Arc::new(holder),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_locked(&self) -> bool {
        self.holder.borrow().is_some()
    }

    /// What the current holder is doing, if the lock is held
    pub fn get_description(&self) -> Option<String> {
        self.holder.borrow().clone()
    }

    fn guard(&self, guard: OwnedMutexGuard<()>, description: String) -> LockGuard {
        debug!(lock = self.name, description = %description, "Lock acquired");
        self.holder.send_replace(Some(description));
        LockGuard {
            name: self.name,
            holder: self.holder.clone(),
            started: Instant::now(),
            _guard: guard,
        }
    }

    /// Wait until the lock is free, then take it. Waiters are served in
    /// FIFO order.
    pub async fn acquire(&self, description: impl Into<String>) -> LockGuard {
        let guard = self.mutex.clone().lock_owned().await;
        self.guard(guard, description.into())
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self, description: impl Into<String>) -> Option<LockGuard> {
        let guard = self.mutex.clone().try_lock_owned().ok()?;
        Some(self.guard(guard, description.into()))
    }

    /// Take the lock, giving up after `timeout`.
    pub async fn acquire_timeout(
        &self,
        description: impl Into<String>,
        timeout: Duration,
    ) -> Result<LockGuard, CoreError> {
        match tokio::time::timeout(timeout, self.mutex.clone().lock_owned()).await {
            Ok(guard) => Ok(self.guard(guard, description.into())),
            Err(_) => Err(CoreError::LockTimeout {
                lock: self.name.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Wait until nobody holds the lock. Returns `false` on timeout.
    pub async fn wait_for_unlock(&self, timeout: Duration) -> bool {
        let mut rx = self.holder.subscribe();
        let unlocked = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|holder| holder.is_none())).await,
            Ok(Ok(_))
        );
        unlocked
    }
}

/// Work that has been accepted but not yet written to the graph.
pub trait PendingWork: Send + Sync {
    /// Events waiting to be drained
    fn pending_count(&self) -> usize;

    /// Whether a drain is in progress
    fn is_processing(&self) -> bool;
}

/// Outcome of waiting for the graph to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsistencyWait {
    /// The caller had to wait at all
    pub waited: bool,
    /// The wait bound elapsed before the graph settled
    pub timed_out: bool,
    pub waited_ms: u64,
}

/// The two locks plus the wait policy shared by readers.
pub struct CoordinationLocks {
    pub ingestion: CoordinationLock,
    pub embedding: CoordinationLock,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl CoordinationLocks {
    pub fn new(wait_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            ingestion: CoordinationLock::new("ingestion"),
            embedding: CoordinationLock::new("embedding"),
            wait_timeout,
            poll_interval,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    fn settled(&self, pending: Option<&dyn PendingWork>, include_embedding: bool) -> bool {
        let queue_idle = pending.map_or(true, |p| p.pending_count() == 0 && !p.is_processing());
        queue_idle
            && !self.ingestion.is_locked()
            && (!include_embedding || !self.embedding.is_locked())
    }

    /// Block until queued work is drained and the ingestion lock (and, when
    /// `include_embedding`, the embedding lock) is free, polling at the
    /// configured interval. Never fails: on timeout the result says so.
    pub async fn wait_for_consistency(
        &self,
        pending: Option<&dyn PendingWork>,
        include_embedding: bool,
        timeout: Option<Duration>,
    ) -> ConsistencyWait {
        let timeout = timeout.unwrap_or(self.wait_timeout);
        let start = Instant::now();
        let mut waited = false;

        loop {
            if self.settled(pending, include_embedding) {
                break;
            }
            if start.elapsed() >= timeout {
                warn!(
                    ingestion = ?self.ingestion.get_description(),
                    embedding = ?self.embedding.get_description(),
                    "Gave up waiting for pending edits after {}ms; results may be stale",
                    timeout.as_millis()
                );
                return ConsistencyWait {
                    waited: true,
                    timed_out: true,
                    waited_ms: start.elapsed().as_millis() as u64,
                };
            }
            waited = true;
            tokio::time::sleep(self.poll_interval).await;
        }

        ConsistencyWait {
            waited,
            timed_out: false,
            waited_ms: start.elapsed().as_millis() as u64,
        }
    }
}

impl Default for CoordinationLocks {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_millis(100))
    }
}
