//! In-memory backend
//!
//! Models a directory-less object store: a flat map of keys to objects,
//! whole-object puts (atomic by construction), and a marker convention for
//! directories and locks. Doubles as the test double for the storage
//! contract, which is how the rest of the core is exercised without a real
//! filesystem.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Storage, StorageError};

#[derive(Debug, Clone)]
struct Object {
    data: Vec<u8>,
    mtime: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<PathBuf, Object>,
    dir_markers: BTreeSet<PathBuf>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn first_child(parent: &Path, descendant: &Path) -> Option<PathBuf> {
    let rest = descendant.strip_prefix(parent).ok()?;
    match rest.components().next()? {
        Component::Normal(c) => Some(parent.join(c)),
        _ => None,
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        self.lock_inner()
            .objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        self.lock_inner().objects.insert(
            path.to_path_buf(),
            Object {
                data: data.to_vec(),
                mtime: Utc::now(),
            },
        );
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        let inner = self.lock_inner();
        inner.objects.contains_key(path)
            || inner.dir_markers.contains(path)
            || inner.objects.keys().any(|k| k.starts_with(path) && k != path)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        let inner = self.lock_inner();
        inner.dir_markers.contains(path)
            || inner.objects.keys().any(|k| k.starts_with(path) && k != path)
    }

    async fn is_file(&self, path: &Path) -> bool {
        self.lock_inner().objects.contains_key(path)
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let inner = self.lock_inner();
        let mut children = BTreeSet::new();
        for key in inner.objects.keys().chain(inner.dir_markers.iter()) {
            if key == path {
                continue;
            }
            if let Some(child) = first_child(path, key) {
                children.insert(child);
            }
        }
        if children.is_empty() && !inner.dir_markers.contains(path) {
            return Err(StorageError::not_found(path));
        }
        Ok(children.into_iter().collect())
    }

    async fn walk(&self, path: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let inner = self.lock_inner();
        Ok(inner
            .objects
            .keys()
            .filter(|k| k.starts_with(path) && *k != path)
            .cloned()
            .collect())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        let mut inner = self.lock_inner();
        let object = inner
            .objects
            .get(src)
            .cloned()
            .ok_or_else(|| StorageError::not_found(src))?;
        inner.objects.insert(dst.to_path_buf(), object);
        Ok(())
    }

    async fn rename(&self, src: &Path, dst: &Path) -> Result<(), StorageError> {
        let mut inner = self.lock_inner();
        let object = inner
            .objects
            .remove(src)
            .ok_or_else(|| StorageError::not_found(src))?;
        inner.objects.insert(dst.to_path_buf(), object);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        self.lock_inner()
            .objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn delete_dir(&self, path: &Path) -> Result<(), StorageError> {
        let mut inner = self.lock_inner();
        inner
            .objects
            .retain(|k, _| !(k.starts_with(path) && k != path));
        inner.dir_markers.retain(|k| !k.starts_with(path));
        Ok(())
    }

    async fn mkdir(&self, path: &Path) -> Result<(), StorageError> {
        self.lock_inner().dir_markers.insert(path.to_path_buf());
        Ok(())
    }

    async fn link(&self, target: &Path, link: &Path) -> Result<(), StorageError> {
        // No symlinks in an object store; a copy satisfies the contract.
        self.copy(target, link).await
    }

    async fn size(&self, path: &Path) -> Result<u64, StorageError> {
        self.lock_inner()
            .objects
            .get(path)
            .map(|o| o.data.len() as u64)
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn upload_time(&self, path: &Path) -> Result<DateTime<Utc>, StorageError> {
        self.lock_inner()
            .objects
            .get(path)
            .map(|o| o.mtime)
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn set_upload_time(
        &self,
        path: &Path,
        time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock_inner();
        let object = inner
            .objects
            .get_mut(path)
            .ok_or_else(|| StorageError::not_found(path))?;
        object.mtime = time;
        Ok(())
    }

    async fn try_lock(&self, path: &Path) -> Result<bool, StorageError> {
        let mut inner = self.lock_inner();
        if inner.objects.contains_key(path) {
            return Ok(false);
        }
        inner.objects.insert(
            path.to_path_buf(),
            Object {
                data: format!("{}\n", std::process::id()).into_bytes(),
                mtime: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn unlock(&self, path: &Path) -> Result<(), StorageError> {
        self.lock_inner().objects.remove(path);
        Ok(())
    }
}
