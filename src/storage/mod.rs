//! Storage abstraction - uniform contract over heterogeneous backends
//!
//! The replication core never touches the filesystem directly; everything
//! goes through the [`Storage`] trait so a POSIX tree and a directory-less
//! object store behave identically. The two guarantees the core leans on:
//!
//! - `write_atomic`/`write_if_changed` publish whole files: a concurrent
//!   reader sees the old content or the new content, never a partial write.
//! - `lock`/`unlock` give mutual exclusion over the replica directory with
//!   a bounded acquisition timeout.
//!
//! Backends are selected by name through [`create_storage`].

pub mod filesystem;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::debug;

pub use crate::errors::StorageError;
pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;

/// Content digest algorithms the mirror can verify against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha256,
}

impl HashAlgo {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Some(HashAlgo::Md5),
            "sha256" => Some(HashAlgo::Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha256 => "sha256",
        }
    }

    /// Start a streaming hasher for this algorithm.
    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgo::Md5 => Hasher::Md5(Md5::new()),
            HashAlgo::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// One-shot digest of a byte slice.
    pub fn digest(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finish()
    }
}

/// Incremental hasher over either supported algorithm.
pub enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finish(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Uniform backend contract. All paths are absolute within the backend's
/// namespace; directory semantics degrade gracefully on backends that only
/// model flat keys (directory creation becomes a marker convention).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Registry name of the backend.
    fn kind(&self) -> &'static str;

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError>;

    /// Write to a temporary location adjacent to the target, then publish
    /// by rename. Readers observe old or new content, never a mix.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError>;

    /// Like `write_atomic`, but aborts (target untouched) when the target
    /// already holds exactly `data`. Returns whether the target changed.
    async fn write_if_changed(&self, path: &Path, data: &[u8]) -> Result<bool, StorageError> {
        match self.read(path).await {
            Ok(existing) if existing == data => {
                debug!("unchanged, skipping rewrite: {}", path.display());
                return Ok(false);
            }
            _ => {}
        }
        self.write_atomic(path, data).await?;
        Ok(true)
    }

    async fn exists(&self, path: &Path) -> bool;
    async fn is_dir(&self, path: &Path) -> bool;
    async fn is_file(&self, path: &Path) -> bool;

    /// Immediate children of a directory.
    async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError>;

    /// All files below a directory, recursively.
    async fn walk(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError>;

    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), StorageError>;
    async fn rename(&self, src: &Path, dst: &Path) -> Result<(), StorageError>;
    async fn delete(&self, path: &Path) -> Result<(), StorageError>;

    /// Forced recursive delete. Deleting a missing tree is not an error.
    async fn delete_dir(&self, path: &Path) -> Result<(), StorageError>;

    /// Create a directory (and parents). A no-op or marker write on
    /// backends without real directories.
    async fn mkdir(&self, path: &Path) -> Result<(), StorageError>;

    /// Make `link` resolve to the content at `target`: a symlink where the
    /// backend supports them, otherwise a copy.
    async fn link(&self, target: &Path, link: &Path) -> Result<(), StorageError>;

    async fn size(&self, path: &Path) -> Result<u64, StorageError>;

    /// Content digest of a stored file.
    async fn digest(&self, path: &Path, algo: HashAlgo) -> Result<String, StorageError> {
        let data = self.read(path).await?;
        Ok(algo.digest(&data))
    }

    async fn upload_time(&self, path: &Path) -> Result<DateTime<Utc>, StorageError>;
    async fn set_upload_time(&self, path: &Path, time: DateTime<Utc>)
        -> Result<(), StorageError>;

    /// Try to take the exclusion marker at `path`. Returns false when it is
    /// already held.
    async fn try_lock(&self, path: &Path) -> Result<bool, StorageError>;

    /// Release the exclusion marker.
    async fn unlock(&self, path: &Path) -> Result<(), StorageError>;
}

/// Acquire the exclusion marker at `path`, polling until `timeout` elapses.
///
/// Fails with [`StorageError::LockContended`] so callers can refuse to run
/// rather than risk a second writer on the same replica.
pub async fn acquire_lock(
    storage: &dyn Storage,
    path: &Path,
    timeout: Duration,
) -> Result<(), StorageError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if storage.try_lock(path).await? {
            debug!("acquired lock: {}", path.display());
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(StorageError::LockContended {
                path: path.to_path_buf(),
                waited_secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Instantiate a backend by its registry name.
pub fn create_storage(backend: &str) -> Result<Arc<dyn Storage>, StorageError> {
    match backend {
        "filesystem" => Ok(Arc::new(FilesystemStorage::new())),
        "memory" => Ok(Arc::new(MemoryStorage::new())),
        other => Err(StorageError::UnknownBackend(other.to_string())),
    }
}
