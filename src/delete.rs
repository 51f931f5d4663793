//! Explicit per-project teardown
//!
//! Removes everything the mirror holds for a project: the raw metadata
//! document, its legacy alias, every simple-dir spelling, and all blobs
//! the stored metadata references. Used by the `delete` subcommand and by
//! the package state machine when a project vanishes upstream.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::StorageError;
use crate::layout::Layout;
use crate::metadata::ProjectMetadata;
use crate::storage::{acquire_lock, create_storage, Storage};
use crate::version::{legacy_normalize, normalize};

/// Remove one project's artifacts. With `dry_run` the plan is logged and
/// nothing is touched.
pub async fn delete_project(
    storage: &dyn Storage,
    layout: &Layout,
    name: &str,
    dry_run: bool,
) -> Result<(), StorageError> {
    let normalized = normalize(name);
    let legacy = legacy_normalize(name);

    // Blobs are only reachable through the stored metadata document.
    let json_path = layout.json_path(&normalized);
    let mut blobs: Vec<PathBuf> = Vec::new();
    if let Ok(bytes) = storage.read(&json_path).await {
        match serde_json::from_slice::<ProjectMetadata>(&bytes) {
            Ok(metadata) => {
                blobs.extend(metadata.all_files().iter().map(|f| layout.blob_path(f)));
            }
            Err(err) => {
                warn!("unparseable stored metadata for {}: {}", name, err);
            }
        }
    }

    let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
    dirs.insert(layout.simple_dir(&normalized));
    dirs.insert(layout.simple_dir(&legacy));
    dirs.insert(layout.legacy_json_path(&normalized).parent().map(PathBuf::from).unwrap_or_default());

    if dry_run {
        info!(
            "[dry-run] would delete {}: {} blobs, {} dirs, metadata at {}",
            name,
            blobs.len(),
            dirs.len(),
            json_path.display()
        );
        for blob in &blobs {
            info!("[dry-run]   blob {}", blob.display());
        }
        return Ok(());
    }

    for blob in blobs {
        if storage.is_file(&blob).await {
            storage.delete(&blob).await?;
        }
    }
    for dir in dirs {
        if dir.as_os_str().is_empty() {
            continue;
        }
        storage.delete_dir(&dir).await?;
    }
    if storage.is_file(&json_path).await {
        storage.delete(&json_path).await?;
    }

    info!("deleted local artifacts for {}", name);
    Ok(())
}

/// CLI entry point: delete several projects under the replica lock.
pub async fn delete_packages(config: &Config, names: &[String], dry_run: bool) -> Result<()> {
    let storage = create_storage(&config.storage.backend)?;
    let layout = Layout::new(config.mirror_root(), config.mirror.hash_index);

    acquire_lock(storage.as_ref(), &layout.lock_path(), config.lock_timeout())
        .await
        .context("another process owns the mirror directory")?;

    let result = async {
        for name in names {
            delete_project(storage.as_ref(), &layout, name, dry_run)
                .await
                .with_context(|| format!("failed to delete {name}"))?;
        }
        Ok(())
    }
    .await;

    storage.unlock(&layout.lock_path()).await?;
    result
}
