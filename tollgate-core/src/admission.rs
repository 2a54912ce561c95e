//! Admission control for upstream inference calls.
//!
//! The runtime behind the gateway can only serve a handful of generations
//! at once. [`AdmissionQueue`] bounds how many jobs run concurrently,
//! parks the overflow in a priority queue, and sheds load once that queue
//! is full.
//!
//! # Architecture
//!
//! ```text
//!   submit(priority, job)
//!          │
//!          ├── active < cap ───────────────► RUNNING ──► Slot dropped ──┐
//!          │                                    ▲                       │
//!          ├── pending == max_depth ──► REJECTED (QueueFull)            │
//!          │                                    │                       │
//!          └── otherwise ──► QUEUED ── woken by drain ──────────────────┘
//!                          (PriorityHeap: priority desc, seq asc)
//! ```
//!
//! All state lives behind one mutex and every transition (admit, enqueue,
//! release + drain) is a single critical section that never awaits, so
//! no caller can observe a half-applied transition.
//!
//! A reserved slot is represented by a [`Slot`] guard. Dropping it releases
//! the slot and runs the drain step, which reserves the freed slot on
//! behalf of the best pending entry and hands the guard over through that
//! entry's one-shot channel. A waiter whose caller gave up never receives
//! the guard; the undelivered guard is reclaimed on the spot.
//!
//! There is no aging: a steady stream of higher-priority submissions can
//! starve lower-priority ones indefinitely.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AdmissionError, QueueFull};
use crate::heap::PriorityHeap;

/// Lowest accepted priority
pub const MIN_PRIORITY: u8 = 1;

/// Highest accepted priority
pub const MAX_PRIORITY: u8 = 10;

/// Priority used when a user has no policy
pub const DEFAULT_PRIORITY: u8 = 5;

/// Clamp any integer priority into `[MIN_PRIORITY, MAX_PRIORITY]`
pub fn normalize_priority(priority: i64) -> u8 {
    priority.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as u8
}

/// Configuration for the admission queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Maximum number of jobs running at once (system-wide)
    pub max_concurrency: usize,

    /// Maximum number of jobs waiting for a slot before new ones are rejected
    pub max_queue_depth: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { max_concurrency: 2, max_queue_depth: 50 }
    }
}

impl AdmissionConfig {
    /// Create a config with explicit limits
    pub fn new(max_concurrency: usize, max_queue_depth: usize) -> Self {
        Self { max_concurrency, max_queue_depth }
    }

    /// Create config from environment variables
    ///
    /// Reads `MAX_CONCURRENCY` and `MAX_QUEUE_DEPTH`; unparsable values keep
    /// the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MAX_CONCURRENCY") {
            if let Ok(n) = val.parse() {
                config.max_concurrency = n;
            }
        }

        if let Ok(val) = std::env::var("MAX_QUEUE_DEPTH") {
            if let Ok(n) = val.parse() {
                config.max_queue_depth = n;
            }
        }

        config
    }
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub max_queue_depth: usize,
}

/// How a submission got its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    /// 1-based rank among pending entries at insertion; `None` if admitted
    /// without waiting
    pub position: Option<usize>,

    /// Wall-clock time between submission and admission
    pub waited: Duration,
}

impl Ticket {
    /// Whether the submission had to wait in the queue
    pub fn was_queued(&self) -> bool {
        self.position.is_some()
    }
}

/// A reserved slot together with the ticket describing how it was obtained
#[derive(Debug)]
pub struct Admission {
    pub slot: Slot,
    pub ticket: Ticket,
}

/// Result of a successfully admitted job. The slot stays reserved until
/// `slot` is dropped.
#[derive(Debug)]
pub struct Admitted<T> {
    pub output: T,
    pub slot: Slot,
    pub ticket: Ticket,
}

struct QueueEntry {
    priority: u8,
    seq: u64,
    wake: oneshot::Sender<Slot>,
}

type EntryOrder = fn(&QueueEntry, &QueueEntry) -> Ordering;

// higher priority first, then FIFO within the same priority
fn compare_entries(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

struct QueueState {
    active: usize,
    next_seq: u64,
    pending: PriorityHeap<QueueEntry, EntryOrder>,
}

struct Shared {
    config: AdmissionConfig,
    state: Mutex<QueueState>,
}

impl Shared {
    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.active == 0 {
            warn!("Slot released with no active jobs");
        }
        state.active = state.active.saturating_sub(1);
        self.drain(&mut state);
    }

    fn drain(self: &Arc<Self>, state: &mut QueueState) {
        while state.active < self.config.max_concurrency {
            let Some(entry) = state.pending.pop() else {
                break;
            };

            state.active += 1;
            let slot = Slot { shared: Some(Arc::clone(self)) };

            match entry.wake.send(slot) {
                Ok(()) => {
                    debug!(priority = entry.priority, seq = entry.seq, "Request dequeued");
                }
                Err(mut slot) => {
                    // waiter was dropped by its caller; reclaim in place
                    slot.shared = None;
                    state.active -= 1;
                    debug!(seq = entry.seq, "Skipping abandoned queue entry");
                }
            }
        }
    }
}

/// Guard for one reserved execution slot. Dropping it releases the slot
/// exactly once and lets the next pending entry in.
#[must_use = "dropping a Slot releases it immediately"]
pub struct Slot {
    shared: Option<Arc<Shared>>,
}

impl Slot {
    /// Release the slot now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("held", &self.shared.is_some()).finish()
    }
}

/// Priority admission queue with a concurrency cap and depth backpressure.
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    /// Create a new queue. A concurrency cap of zero is raised to one.
    pub fn new(config: AdmissionConfig) -> Self {
        let config = AdmissionConfig {
            max_concurrency: config.max_concurrency.max(1),
            ..config
        };
        let pending = PriorityHeap::with_capacity(
            config.max_queue_depth.min(1024),
            compare_entries as EntryOrder,
        );

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState { active: 0, next_seq: 0, pending }),
            }),
        }
    }

    /// Queue configuration
    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Reserve a slot, waiting in the queue if every slot is busy.
    ///
    /// Fails immediately with [`QueueFull`] when the queue already holds
    /// `max_queue_depth` entries.
    pub async fn acquire(&self, priority: u8) -> Result<Admission, AdmissionError> {
        let submitted = Instant::now();
        let priority = normalize_priority(priority as i64);

        let (wake, position) = {
            let mut state = self.shared.state.lock();

            if state.active < self.shared.config.max_concurrency {
                state.active += 1;
                debug!(priority, active = state.active, "Request admitted");
                return Ok(Admission {
                    slot: Slot { shared: Some(Arc::clone(&self.shared)) },
                    ticket: Ticket { position: None, waited: Duration::ZERO },
                });
            }

            let depth = state.pending.len();
            if depth >= self.shared.config.max_queue_depth {
                debug!(priority, depth, "Request rejected, queue full");
                return Err(QueueFull { depth }.into());
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(QueueEntry { priority, seq, wake: tx });

            debug!(priority, seq, position = depth + 1, "Request queued");
            (rx, depth + 1)
        };

        let slot = wake.await.map_err(|_| AdmissionError::Closed)?;

        Ok(Admission {
            slot,
            ticket: Ticket { position: Some(position), waited: submitted.elapsed() },
        })
    }

    /// Admit `job` under a slot and run it.
    ///
    /// On success the slot is returned to the caller inside [`Admitted`]
    /// and is released when dropped. If the job fails the slot is released
    /// before the error propagates.
    pub async fn submit<T, E, F, Fut>(&self, priority: u8, job: F) -> Result<Admitted<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let Admission { slot, ticket } = self.acquire(priority).await?;

        match job().await {
            Ok(output) => Ok(Admitted { output, slot, ticket }),
            Err(err) => {
                slot.release();
                Err(err)
            }
        }
    }

    /// Consistent snapshot of the queue
    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        QueueStatus {
            active: state.active,
            queued: state.pending.len(),
            max_concurrency: self.shared.config.max_concurrency,
            max_queue_depth: self.shared.config.max_queue_depth,
        }
    }
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}
