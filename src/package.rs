//! Package Sync - per-project state machine
//!
//! One project moves through fetch -> filter -> download+verify -> write
//! pages -> commit, with an error exit at each stage. The stages are
//! strictly sequential; pages are only rendered once every surviving file
//! has been verified, so the published index never references bytes the
//! mirror does not hold.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::delete::delete_project;
use crate::errors::SyncError;
use crate::filters::FilterPipeline;
use crate::layout::Layout;
use crate::metadata::{ProjectMetadata, ReleaseFile};
use crate::simple::{SimpleFormat, SimpleRenderer};
use crate::storage::{HashAlgo, Storage};
use crate::upstream::UpstreamClient;
use crate::version::{legacy_normalize, normalize};

/// One project's unit of work for a run. Ephemeral: built when the work
/// set is determined, discarded when the run ends.
#[derive(Debug, Clone)]
pub struct Package {
    /// Name as received from upstream; may be unnormalized.
    pub raw_name: String,
    /// PEP 503 canonical name; directory names derive from this.
    pub name: String,
    /// Historical normalization variant, for the duplicate simple dir.
    pub legacy_name: String,
    /// Serial this project should be synced at.
    pub serial: u64,
}

impl Package {
    pub fn new(raw_name: impl Into<String>, serial: u64) -> Self {
        let raw_name = raw_name.into();
        let name = normalize(&raw_name);
        let legacy_name = legacy_normalize(&raw_name);
        Package {
            raw_name,
            name,
            legacy_name,
            serial,
        }
    }
}

/// How a project run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    /// Metadata, files and pages are in place. `changed` reports whether
    /// any stored byte actually differed.
    Synced { changed: bool },
    /// The filter pipeline removed everything; nothing fetched or written.
    /// Explicitly not an error.
    Filtered,
    /// Gone upstream; local artifacts were removed.
    Deleted,
}

/// Executes the package state machine against one mirror.
pub struct PackageSyncer {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    layout: Layout,
    filters: Arc<FilterPipeline>,
    upstream: UpstreamClient,
    renderer: SimpleRenderer,
    format: SimpleFormat,
}

impl PackageSyncer {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<dyn Storage>,
        filters: Arc<FilterPipeline>,
        upstream: UpstreamClient,
    ) -> anyhow::Result<Self> {
        let layout = Layout::new(config.mirror_root(), config.mirror.hash_index);
        let algo = config
            .hash_algo()
            .ok_or_else(|| anyhow::anyhow!("unknown digest: {}", config.mirror.digest_name))?;
        let format = SimpleFormat::parse(&config.mirror.simple_format)
            .ok_or_else(|| anyhow::anyhow!("unknown simple_format: {}", config.mirror.simple_format))?;
        let renderer = SimpleRenderer::new(layout.clone(), algo, config.mirror.root_uri.clone());

        Ok(Self {
            config,
            storage,
            layout,
            filters,
            upstream,
            renderer,
            format,
        })
    }

    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_max_times(5)
            .with_jitter()
    }

    /// Run the whole state machine for one package.
    pub async fn sync(&self, package: &Package) -> Result<PackageOutcome, SyncError> {
        debug!("syncing {} at serial {}", package.raw_name, package.serial);

        // Fetch, retrying while the upstream lags behind the serial the
        // changelog promised us.
        let fetch = || self.upstream.fetch_metadata(&package.raw_name, package.serial);
        let fetched = fetch
            .retry(&Self::backoff())
            .when(SyncError::is_retryable)
            .notify(|err: &SyncError, dur: Duration| {
                warn!("retrying {} in {:?}: {}", package.raw_name, dur, err);
            })
            .await;

        let (raw, mut metadata) = match fetched {
            Ok(result) => result,
            Err(SyncError::NotFound(_)) => {
                info!("{} no longer exists upstream, deleting locally", package.raw_name);
                delete_project(self.storage.as_ref(), &self.layout, &package.raw_name, false)
                    .await?;
                return Ok(PackageOutcome::Deleted);
            }
            Err(err) => return Err(err),
        };

        // Filter: releases, then files, then the aggregate check.
        self.filters.apply_release_filters(&mut metadata);
        self.filters.apply_file_filters(&mut metadata);
        if metadata.releases.is_empty() {
            debug!("{} has no releases left after filtering", package.raw_name);
            return Ok(PackageOutcome::Filtered);
        }
        if !self.filters.admits_metadata(&metadata) {
            return Ok(PackageOutcome::Filtered);
        }

        // Download and verify every surviving file. A digest mismatch
        // fails the project but does not stop its other files.
        let mut changed = false;
        let mut first_error: Option<SyncError> = None;
        for file in metadata.all_files() {
            match self.sync_file(package, file).await {
                Ok(file_changed) => changed |= file_changed,
                Err(err @ SyncError::DigestMismatch { .. }) => {
                    warn!("{}: {}", package.raw_name, err);
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        // Only now is the project allowed to become visible.
        changed |= self.write_metadata_docs(package, &raw).await?;
        changed |= self.write_simple_pages(package, &metadata).await?;

        info!(
            "synced {} at serial {} ({})",
            package.raw_name,
            package.serial,
            if changed { "changed" } else { "unchanged" }
        );
        Ok(PackageOutcome::Synced { changed })
    }

    /// Download one release file unless a verified copy already exists.
    async fn sync_file(
        &self,
        package: &Package,
        file: &ReleaseFile,
    ) -> Result<bool, SyncError> {
        let path = self.layout.blob_path(file);
        let (declared_algo, declared_hash) =
            file.digest().ok_or_else(|| SyncError::Malformed {
                package: package.raw_name.clone(),
                reason: format!("{} declares no digest", file.filename),
            })?;
        let declared_algo =
            HashAlgo::parse(declared_algo).ok_or_else(|| SyncError::Malformed {
                package: package.raw_name.clone(),
                reason: format!("{} declares unknown digest {declared_algo}", file.filename),
            })?;
        let declared_hash = declared_hash.to_lowercase();

        if self.storage.exists(&path).await {
            let current = match self.config.mirror.compare_method.as_str() {
                "stat" => self.storage.size(&path).await? == file.size && file.size > 0,
                _ => self.storage.digest(&path, declared_algo).await? == declared_hash,
            };
            if current {
                debug!("already have {}", file.filename);
                return Ok(false);
            }
        }

        let (bytes, actual) = self.upstream.download(&file.url, declared_algo).await?;
        if actual != declared_hash {
            // The downloaded bytes never reach storage.
            return Err(SyncError::DigestMismatch {
                filename: file.filename.clone(),
                expected: declared_hash,
                actual,
            });
        }

        self.storage.write_atomic(&path, &bytes).await?;

        if let Some(upload_time) = file
            .upload_time_iso_8601
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        {
            if let Err(err) = self
                .storage
                .set_upload_time(&path, upload_time.with_timezone(&Utc))
                .await
            {
                debug!("could not set upload time on {}: {}", path.display(), err);
            }
        }

        debug!("stored {} ({} bytes)", file.filename, bytes.len());
        Ok(true)
    }

    /// Republish the raw upstream document and its legacy alias.
    async fn write_metadata_docs(
        &self,
        package: &Package,
        raw: &serde_json::Value,
    ) -> Result<bool, SyncError> {
        let json_path = self.layout.json_path(&package.name);
        let body = raw.to_string();
        let changed = self
            .storage
            .write_if_changed(&json_path, body.as_bytes())
            .await?;

        let legacy = self.layout.legacy_json_path(&package.name);
        if changed || !self.storage.exists(&legacy).await {
            self.storage.link(&json_path, &legacy).await?;
        }
        Ok(changed)
    }

    /// Render pages into the canonical simple dir, and the legacy-normalized
    /// duplicate when the two spellings differ.
    async fn write_simple_pages(
        &self,
        package: &Package,
        metadata: &ProjectMetadata,
    ) -> Result<bool, SyncError> {
        let serial = metadata.last_serial.max(package.serial);
        let mut changed = false;

        let mut dirs = vec![package.name.clone()];
        if package.legacy_name != package.name {
            dirs.push(package.legacy_name.clone());
        }

        let html = self.format.wants_html().then(|| self.renderer.render_html(metadata, serial));
        let json = self.format.wants_json().then(|| self.renderer.render_json(metadata, serial));

        for dir in &dirs {
            if let Some(html) = &html {
                let path = self.layout.simple_html(dir);
                changed |= self.write_page(&path, html.as_bytes(), serial).await?;
            }
            if let Some(json) = &json {
                let path = self.layout.simple_json(dir);
                changed |= self.write_page(&path, json.as_bytes(), serial).await?;
            }
        }
        Ok(changed)
    }

    /// Publish one page, archiving previous versions when retention is
    /// configured. With retention the visible path is a link repointed to
    /// the newest archived copy.
    async fn write_page(
        &self,
        path: &std::path::Path,
        content: &[u8],
        serial: u64,
    ) -> Result<bool, SyncError> {
        let keep = self.config.mirror.keep_index_versions;
        if keep == 0 {
            return Ok(self.storage.write_if_changed(path, content).await?);
        }

        if let Ok(existing) = self.storage.read(path).await {
            if existing == content {
                return Ok(false);
            }
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "index".to_string());
        let parent = path.parent().unwrap_or(std::path::Path::new(""));
        let versions_dir = parent.join("versions");

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let archived = versions_dir.join(format!("{filename}.{serial}.{stamp}"));
        self.storage.write_atomic(&archived, content).await?;

        // Prune archives beyond the retention count, oldest first.
        let mut archives: Vec<_> = self
            .storage
            .list_dir(&versions_dir)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&format!("{filename}.")))
                    .unwrap_or(false)
            })
            .collect();
        archives.sort();
        while archives.len() > keep {
            let oldest = archives.remove(0);
            debug!("pruning archived page {}", oldest.display());
            self.storage.delete(&oldest).await?;
        }

        self.storage.link(&archived, path).await?;
        Ok(true)
    }
}
