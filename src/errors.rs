//! Error taxonomy for the replication core
//!
//! Sync failures are modeled as typed errors rather than control flow so
//! the engine can distinguish outcomes that are retried within a run
//! (upstream serial lag), outcomes that fail the run for one project
//! (digest mismatch, storage fault), and outcomes that are not errors at
//! all (project vanished upstream, handled by the package state machine).

use std::path::PathBuf;

use thiserror::Error;

/// Faults raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} does not exist")]
    NotFound { path: PathBuf },

    #[error("lock at {path} is held by another process (waited {waited_secs}s)")]
    LockContended { path: PathBuf, waited_secs: u64 },

    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        StorageError::NotFound { path: path.into() }
    }
}

/// Errors surfaced while syncing a single project.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The upstream has not yet made the requested serial visible. Retried
    /// with backoff inside the package state machine.
    #[error("upstream serial for {package} not yet visible: have {have}, need {need}")]
    StaleSerial {
        package: String,
        have: u64,
        need: u64,
    },

    /// Downloaded bytes hash differently than the declared digest. The
    /// payload is discarded; the file is re-attempted on the next run.
    #[error("digest mismatch for {filename}: expected {expected}, got {actual}")]
    DigestMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// The project is gone upstream. Not an error: the caller deletes the
    /// local artifacts instead.
    #[error("project {0} not found upstream")]
    NotFound(String),

    /// The upstream answered but the document cannot be used.
    #[error("malformed metadata for {package}: {reason}")]
    Malformed { package: String, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Whether the package state machine should retry the operation within
    /// the current run.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::StaleSerial { .. } => true,
            SyncError::Upstream(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
