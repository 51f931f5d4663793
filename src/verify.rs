//! Verification and repair
//!
//! Batch consistency pass over an existing replica: re-crawl every stored
//! metadata document, confirm each referenced blob exists with the right
//! digest (re-fetching when it does not), drop projects that vanished
//! upstream, and optionally delete blobs no known project references.
//! `dry_run` reports every action without mutating anything.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::delete::delete_project;
use crate::errors::SyncError;
use crate::layout::Layout;
use crate::metadata::ProjectMetadata;
use crate::storage::{acquire_lock, create_storage, HashAlgo, Storage};
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub dry_run: bool,
    /// Also delete blobs not referenced by any stored metadata.
    pub delete_unowned: bool,
}

#[derive(Debug, Default)]
pub struct VerifySummary {
    pub projects: usize,
    pub files_checked: usize,
    pub files_repaired: usize,
    pub projects_deleted: usize,
    pub unowned_deleted: usize,
    pub errors: usize,
}

/// Run the verification pass.
pub async fn verify_mirror(config: &Config, options: VerifyOptions) -> Result<VerifySummary> {
    let storage = create_storage(&config.storage.backend)?;
    let layout = Layout::new(config.mirror_root(), config.mirror.hash_index);
    let upstream = UpstreamClient::new(config)?;

    acquire_lock(storage.as_ref(), &layout.lock_path(), config.lock_timeout())
        .await
        .context("another process owns the mirror directory")?;

    let result = verify_inner(storage.as_ref(), &layout, &upstream, options).await;

    storage.unlock(&layout.lock_path()).await?;
    result
}

async fn verify_inner(
    storage: &dyn Storage,
    layout: &Layout,
    upstream: &UpstreamClient,
    options: VerifyOptions,
) -> Result<VerifySummary> {
    let mut summary = VerifySummary::default();
    let mut owned: BTreeSet<PathBuf> = BTreeSet::new();

    let json_dir = layout.web_dir().join("json");
    let stored = match storage.list_dir(&json_dir).await {
        Ok(entries) => entries,
        Err(_) => {
            info!("no stored metadata to verify");
            return Ok(summary);
        }
    };

    for json_path in stored {
        let Some(name) = json_path.file_name().map(|n| n.to_string_lossy().to_string())
        else {
            continue;
        };
        summary.projects += 1;

        // Re-crawl: the upstream's current view wins over the stored one.
        let fresh = match upstream.fetch_metadata(&name, 0).await {
            Ok((raw, metadata)) => Some((raw, metadata)),
            Err(SyncError::NotFound(_)) => {
                info!("{} vanished upstream", name);
                summary.projects_deleted += 1;
                delete_project(storage, layout, &name, options.dry_run).await?;
                continue;
            }
            Err(err) => {
                warn!("could not re-crawl {}: {}", name, err);
                summary.errors += 1;
                // Fall back to the stored document so its blobs still
                // count as owned.
                storage
                    .read(&json_path)
                    .await
                    .ok()
                    .and_then(|b| serde_json::from_slice(&b).ok())
                    .map(|m: ProjectMetadata| (serde_json::Value::Null, m))
            }
        };

        let Some((raw, metadata)) = fresh else {
            continue;
        };

        if !raw.is_null() && !options.dry_run {
            storage
                .write_if_changed(&json_path, raw.to_string().as_bytes())
                .await?;
        }

        for file in metadata.all_files() {
            let blob = layout.blob_path(file);
            owned.insert(blob.clone());
            summary.files_checked += 1;

            let Some((algo_name, declared)) = file.digest() else {
                continue;
            };
            let Some(algo) = HashAlgo::parse(algo_name) else {
                continue;
            };
            let declared = declared.to_lowercase();

            let intact = storage.is_file(&blob).await
                && storage.digest(&blob, algo).await? == declared;
            if intact {
                continue;
            }

            if options.dry_run {
                info!("[dry-run] would re-fetch {}", file.filename);
                summary.files_repaired += 1;
                continue;
            }

            match upstream.download(&file.url, algo).await {
                Ok((bytes, actual)) if actual == declared => {
                    storage.write_atomic(&blob, &bytes).await?;
                    summary.files_repaired += 1;
                    info!("re-fetched {}", file.filename);
                }
                Ok((_, actual)) => {
                    warn!(
                        "re-fetched {} but digest still wrong: expected {}, got {}",
                        file.filename, declared, actual
                    );
                    summary.errors += 1;
                }
                Err(err) => {
                    warn!("could not re-fetch {}: {}", file.filename, err);
                    summary.errors += 1;
                }
            }
        }
    }

    if options.delete_unowned {
        summary.unowned_deleted =
            delete_unowned(storage, layout, &owned, options.dry_run).await?;
    }

    info!(
        "verify finished: {} projects, {} files checked, {} repaired, {} deleted projects, {} unowned removed, {} errors",
        summary.projects,
        summary.files_checked,
        summary.files_repaired,
        summary.projects_deleted,
        summary.unowned_deleted,
        summary.errors
    );
    Ok(summary)
}

/// Remove blobs nothing references anymore.
async fn delete_unowned(
    storage: &dyn Storage,
    layout: &Layout,
    owned: &BTreeSet<PathBuf>,
    dry_run: bool,
) -> Result<usize> {
    let packages_root = layout.packages_root();
    let Ok(all_blobs) = storage.walk(&packages_root).await else {
        return Ok(0);
    };

    let mut removed = 0;
    for blob in all_blobs {
        if owned.contains(&blob) {
            continue;
        }
        removed += 1;
        if dry_run {
            info!("[dry-run] would delete unowned {}", blob.display());
        } else {
            info!("deleting unowned {}", blob.display());
            storage.delete(&blob).await?;
        }
    }
    Ok(removed)
}
