//! Error types for the Tollgate core library
//!
//! # Error Hierarchy
//!
//! ```text
//! tollgate_core::error
//! ├── AdmissionError - Admission queue failures
//! │   └── QueueFull   - Wait queue saturated at submission time
//! └── StoreError      - Ledger / policy store failures
//! ```
//!
//! Library code returns these concrete types. The proxy crate folds them
//! into its own `ProxyError`, which knows how to render an HTTP response.

use thiserror::Error;

/// Submission rejected at the door: every slot is busy and the wait queue
/// already holds `depth` entries.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Queue is full ({depth} pending requests)")]
pub struct QueueFull {
    /// Pending depth observed at the instant of rejection
    pub depth: usize,
}

/// Errors raised while waiting for an execution slot
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// Rejected by backpressure; never entered the queue
    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    /// The queue dropped the entry without waking it
    #[error("Admission queue closed")]
    Closed,
}

/// Errors raised by a usage ledger, policy store or user directory
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The referenced user does not exist
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// A write conflicted with existing data
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backing store is unreachable or failed
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Create an unknown-user error
    pub fn unknown_user(user_id: impl Into<String>) -> Self {
        Self::UnknownUser(user_id.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => Self::Conflict(db.message().to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
