//! POSIX filesystem backend
//!
//! Atomic publication is rename-based: content lands in a hidden temp file
//! next to the target and is moved into place, so readers polling the
//! target never see a half-written page or blob.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use tokio::fs;

use super::{Storage, StorageError};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
pub struct FilesystemStorage;

impl FilesystemStorage {
    pub fn new() -> Self {
        FilesystemStorage
    }

    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let unique = format!(
            ".{}.{}-{}.tmp",
            name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        target.with_file_name(unique)
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }
}

fn map_io(path: &Path, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::not_found(path)
    } else {
        StorageError::io(path, err)
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        fs::read(path).await.map_err(|e| map_io(path, e))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        Self::ensure_parent(path).await?;
        let tmp = Self::temp_path(path);
        fs::write(&tmp, data)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::io(path, e));
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.is_ok()
    }

    async fn is_dir(&self, path: &Path) -> bool {
        fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    async fn is_file(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let mut entries = fs::read_dir(path).await.map_err(|e| map_io(path, e))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(path, e))? {
            out.push(entry.path());
        }
        out.sort();
        Ok(out)
    }

    async fn walk(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| map_io(&dir, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(&dir, e))? {
                let entry_path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| map_io(&entry_path, e))?;
                if file_type.is_dir() {
                    pending.push(entry_path);
                } else {
                    files.push(entry_path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        Self::ensure_parent(dst).await?;
        fs::copy(src, dst).await.map_err(|e| map_io(src, e))?;
        Ok(())
    }

    async fn rename(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        Self::ensure_parent(dst).await?;
        fs::rename(src, dst).await.map_err(|e| map_io(src, e))
    }

    async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_file(path).await.map_err(|e| map_io(path, e))
    }

    async fn delete_dir(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn mkdir(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn link(&self, target: &Path, link: &Path) -> Result<(), StorageError> {
        Self::ensure_parent(link).await?;
        if fs::symlink_metadata(link).await.is_ok() {
            fs::remove_file(link).await.map_err(|e| map_io(link, e))?;
        }
        #[cfg(unix)]
        {
            fs::symlink(target, link)
                .await
                .map_err(|e| StorageError::io(link, e))
        }
        #[cfg(not(unix))]
        {
            fs::copy(target, link)
                .await
                .map_err(|e| map_io(target, e))?;
            Ok(())
        }
    }

    async fn size(&self, path: &Path) -> Result<u64, StorageError> {
        let meta = fs::metadata(path).await.map_err(|e| map_io(path, e))?;
        Ok(meta.len())
    }

    async fn upload_time(&self, path: &Path) -> Result<DateTime<Utc>, StorageError> {
        let meta = fs::metadata(path).await.map_err(|e| map_io(path, e))?;
        let mtime = meta.modified().map_err(|e| StorageError::io(path, e))?;
        Ok(DateTime::<Utc>::from(mtime))
    }

    async fn set_upload_time(
        &self,
        path: &Path,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let ft = FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos());
        filetime::set_file_mtime(path, ft).map_err(|e| map_io(path, e))
    }

    async fn try_lock(&self, path: &Path) -> Result<bool, StorageError> {
        Self::ensure_parent(path).await?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(path).await {
            Ok(_file) => {
                // Record the owner for post-mortem debugging.
                let _ = fs::write(path, format!("{}\n", std::process::id())).await;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn unlock(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}
