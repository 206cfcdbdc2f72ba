//! Admission control for interpreter runs
//!
//! At most `process_limit` runs hold a [`RunPermit`] at once. Requests that
//! arrive while every slot is taken wait in a FIFO line of at most
//! `queue_limit` entries for up to `queue_timeout`; anything beyond that is
//! rejected. Counter updates and line insert/remove happen under one lock, so
//! each waiting entry leaves the line exactly once: promoted, timed out, or
//! abandoned by its client.

use crate::config::Config;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Why a request was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Every slot busy and the waiting line is full
    #[error("waiting line is full")]
    QueueFull,
    /// Waited longer than the wait timeout
    #[error("timed out waiting for a free slot")]
    WaitTimeout,
    /// The queue dropped the entry without promoting it
    #[error("admission queue closed")]
    Closed,
}

/// Configuration for the admission queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum concurrent runs
    pub process_limit: usize,
    /// Maximum run time before the process is killed
    pub process_timeout: Duration,
    /// Maximum waiting requests
    pub queue_limit: usize,
    /// Maximum time a request may wait
    pub queue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_limit: 20,
            process_timeout: Duration::from_millis(60_000),
            queue_limit: 200,
            queue_timeout: Duration::from_millis(600_000),
        }
    }
}

impl QueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            process_limit: config.process.limit,
            process_timeout: config.process.timeout(),
            queue_limit: config.queue.limit,
            queue_timeout: config.queue.timeout(),
        }
    }
}

/// Statistics for the admission queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Requests that got a slot without waiting
    pub admitted: AtomicU64,
    /// Requests placed in the waiting line
    pub queued: AtomicU64,
    /// Waiting requests that got a slot
    pub promoted: AtomicU64,
    /// Requests rejected because the line was full
    pub rejected_full: AtomicU64,
    /// Waiting requests rejected by the wait timeout
    pub rejected_timeout: AtomicU64,
    /// Waiting requests whose client went away
    pub abandoned: AtomicU64,
    /// Runs killed by the run timeout
    pub run_timeouts: AtomicU64,
}

impl QueueStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a run killed by its timeout
    pub fn record_run_timeout(&self) {
        Self::bump(&self.run_timeouts);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// A request parked until a slot frees up
struct WaitingEntry {
    enqueued_at: Instant,
    promote: oneshot::Sender<RunPermit>,
}

#[derive(Default)]
struct QueueState {
    running: usize,
    /// Live entries; the waiting count is `entries.len()`
    entries: HashMap<u64, WaitingEntry>,
    /// Arrival order. Ids whose entry is gone are skipped when draining.
    order: VecDeque<u64>,
    next_id: u64,
}

impl QueueState {
    fn remove_waiting(&mut self, id: u64) -> Option<WaitingEntry> {
        let entry = self.entries.remove(&id)?;
        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order.retain(|id| entries.contains_key(id));
        }
        Some(entry)
    }
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    stats: QueueStats,
}

impl QueueInner {
    /// Give back one slot and promote waiters into the free capacity
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.running = state.running.saturating_sub(1);
        self.drain(&mut state);
        debug!(
            running = state.running,
            waiting = state.entries.len(),
            "Run slot released"
        );
    }

    fn drain(self: &Arc<Self>, state: &mut QueueState) {
        while state.running < self.config.process_limit {
            let Some(id) = state.order.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.remove(&id) else {
                continue;
            };

            state.running += 1;
            let permit = RunPermit {
                inner: Arc::clone(self),
                released: false,
            };
            match entry.promote.send(permit) {
                Ok(()) => {
                    QueueStats::bump(&self.stats.promoted);
                    debug!(
                        entry_id = id,
                        waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                        "Waiting request promoted"
                    );
                }
                Err(mut permit) => {
                    // Receiver already gone; undo in place, we hold the lock
                    permit.released = true;
                    state.running -= 1;
                    QueueStats::bump(&self.stats.abandoned);
                }
            }
        }
    }
}

/// The worker pool guarding one interpreter binary
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(config: QueueConfig) -> Self {
        debug!(
            process_limit = config.process_limit,
            queue_limit = config.queue_limit,
            "Admission queue initialized"
        );
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
                stats: QueueStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &QueueStats {
        &self.inner.stats
    }

    /// Runs currently holding a slot
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Requests currently in the waiting line
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Wait for a run slot.
    ///
    /// Returns immediately when a slot is free or the line is full. Otherwise
    /// the caller waits in line; dropping the returned future (client went
    /// away) removes the entry without any response.
    pub async fn acquire(&self) -> Result<RunPermit, Rejection> {
        let (id, promoted) = {
            let mut state = self.inner.state.lock();

            if state.running < self.inner.config.process_limit {
                state.running += 1;
                QueueStats::bump(&self.inner.stats.admitted);
                return Ok(RunPermit {
                    inner: Arc::clone(&self.inner),
                    released: false,
                });
            }

            if state.entries.len() >= self.inner.config.queue_limit {
                QueueStats::bump(&self.inner.stats.rejected_full);
                warn!(
                    running = state.running,
                    waiting = state.entries.len(),
                    "Waiting line full, rejecting request"
                );
                return Err(Rejection::QueueFull);
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.entries.insert(
                id,
                WaitingEntry {
                    enqueued_at: Instant::now(),
                    promote: tx,
                },
            );
            state.order.push_back(id);
            QueueStats::bump(&self.inner.stats.queued);
            debug!(
                entry_id = id,
                running = state.running,
                waiting = state.entries.len(),
                "Request queued"
            );
            (id, rx)
        };

        let mut guard = WaitGuard {
            inner: Arc::clone(&self.inner),
            id,
            settled: false,
        };

        match tokio::time::timeout(self.inner.config.queue_timeout, promoted).await {
            Ok(Ok(permit)) => {
                guard.settled = true;
                Ok(permit)
            }
            Ok(Err(_)) => {
                guard.settled = true;
                Err(Rejection::Closed)
            }
            Err(_) => {
                // A promotion racing the timer left its permit in the dropped
                // channel, which released the slot again
                guard.settled = true;
                if self.inner.state.lock().remove_waiting(id).is_some() {
                    QueueStats::bump(&self.inner.stats.rejected_timeout);
                    warn!(entry_id = id, "Request timed out in waiting line");
                }
                Err(Rejection::WaitTimeout)
            }
        }
    }
}

/// Removes a waiting entry when `acquire` is dropped before it settles
struct WaitGuard {
    inner: Arc<QueueInner>,
    id: u64,
    settled: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.inner.state.lock().remove_waiting(self.id).is_some() {
            QueueStats::bump(&self.inner.stats.abandoned);
            debug!(entry_id = self.id, "Client left the waiting line");
        }
    }
}

/// One occupied run slot; dropping it frees the slot exactly once
pub struct RunPermit {
    inner: Arc<QueueInner>,
    released: bool,
}

impl RunPermit {
    /// Free the slot now instead of at drop
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release();
        }
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for RunPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunPermit")
            .field("released", &self.released)
            .finish()
    }
}
