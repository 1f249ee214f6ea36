//! Error types for queue, lock and config operations.
//!
//! The processor matches on these variants to decide between "try again
//! later", "block this request" and "fail this request".

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::request::RequestStatus;

/// Errors returned by [`QueueStore`](crate::QueueStore) operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue document could not be parsed or is structurally invalid
    /// (duplicate ids, unsupported version). Processing must stop.
    #[error("queue file {} is corrupt: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    /// No request with this id.
    #[error("merge request not found: {0}")]
    NotFound(String),

    /// A status change that violates the forward-only state machine.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// A field update that would break a request invariant
    /// (e.g. decreasing `retry_count`).
    #[error("integrity violation on {id}: {message}")]
    Integrity { id: String, message: String },

    /// Rejected caller input (empty or malformed ref names).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors returned by [`LockManager`](crate::LockManager).
#[derive(Debug, Error)]
pub enum LockError {
    /// Not an error condition for the processor: try again later.
    #[error("timed out after {waited:?} waiting for lock `{name}`")]
    Timeout { name: String, waited: Duration },

    /// The OS lock is held by a live handle; it cannot be force-released.
    #[error("lock `{name}` is held by a live process{}", .holder_pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    Held { name: String, holder_pid: Option<u32> },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Errors loading or validating `config.json`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<LockError> for QueueError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Storage(inner) => QueueError::Storage(inner),
            other => QueueError::Storage(other.into()),
        }
    }
}

impl QueueError {
    /// Integrity violations block the affected request until an operator
    /// intervenes.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidTransition { .. }
                | QueueError::Integrity { .. }
                | QueueError::Corrupt { .. }
        )
    }
}
