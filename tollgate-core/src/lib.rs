// Tollgate Core Library
//
// Admission scheduling, rate-limit evaluation and the usage ledger seam
// shared by the gateway binary and its tests.

pub mod admission;
pub mod error;
pub mod heap;
pub mod limits;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use admission::{
    normalize_priority, Admission, AdmissionConfig, AdmissionQueue, Admitted, QueueStatus, Slot,
    Ticket, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
pub use error::{AdmissionError, QueueFull, StoreError, StoreResult};
pub use heap::PriorityHeap;
pub use limits::{LimitDecision, LimitKind, RateLimiter};
pub use store::{
    MemoryStore, ModelUsage, PolicyStore, PolicyUpdate, RateLimitPolicy, TokenUsage, UsageLedger,
    UsageRecord, User, UserDirectory,
};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
