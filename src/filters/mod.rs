//! Filter Pipeline - composable admission control for replication
//!
//! Four extension points decide what the mirror carries, each composed as
//! logical AND across every enabled filter of that kind:
//!
//! - [`ProjectFilter`]: name-only accept/reject, consulted before any
//!   network fetch
//! - [`ReleaseFilter`]: removes whole version entries from a project's
//!   release mapping
//! - [`ReleaseFileFilter`]: removes individual files within a version;
//!   versions left empty are dropped
//! - [`MetadataFilter`]: whole-project accept/reject over aggregate
//!   attributes, evaluated once the mapping is otherwise final
//!
//! Filters are plain values selected by name from a static registry; no
//! runtime plugin loading.

pub mod allowdeny;
pub mod latest;
pub mod platform;
pub mod prerelease;
pub mod regex;
pub mod size;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::config::Config;
use crate::metadata::{ProjectMetadata, ReleaseFile};

/// Accept or reject a whole project given only its normalized name.
pub trait ProjectFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn admits(&self, normalized: &str) -> bool;
}

/// Remove disallowed version entries from a project's release mapping.
pub trait ReleaseFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter_releases(&self, metadata: &mut ProjectMetadata);
}

/// Accept or reject one file of one release.
pub trait ReleaseFileFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn admits(&self, version: &str, file: &ReleaseFile) -> bool;
}

/// Whole-project accept/reject over the finalized metadata.
pub trait MetadataFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn admits(&self, metadata: &ProjectMetadata) -> bool;
}

/// All enabled filters, grouped by extension point.
#[derive(Default)]
pub struct FilterPipeline {
    project: Vec<Arc<dyn ProjectFilter>>,
    release: Vec<Arc<dyn ReleaseFilter>>,
    release_file: Vec<Arc<dyn ReleaseFileFilter>>,
    metadata: Vec<Arc<dyn MetadataFilter>>,
}

impl FilterPipeline {
    /// A project survives iff every project filter admits it.
    pub fn admits_project(&self, normalized: &str) -> bool {
        for filter in &self.project {
            if !filter.admits(normalized) {
                debug!("project {} denied by filter {}", normalized, filter.name());
                return false;
            }
        }
        true
    }

    /// Run every release filter over the mapping in registration order.
    /// A version survives iff no filter removed it.
    pub fn apply_release_filters(&self, metadata: &mut ProjectMetadata) {
        for filter in &self.release {
            filter.filter_releases(metadata);
        }
    }

    /// Drop files rejected by any file filter, then drop versions whose
    /// file list became empty.
    pub fn apply_file_filters(&self, metadata: &mut ProjectMetadata) {
        if self.release_file.is_empty() {
            return;
        }
        for (version, files) in metadata.releases.iter_mut() {
            files.retain(|file| {
                self.release_file
                    .iter()
                    .all(|filter| filter.admits(version, file))
            });
        }
        metadata.releases.retain(|_, files| !files.is_empty());
    }

    /// The finalized project survives iff every metadata filter admits it.
    pub fn admits_metadata(&self, metadata: &ProjectMetadata) -> bool {
        for filter in &self.metadata {
            if !filter.admits(metadata) {
                debug!(
                    "project {} denied by metadata filter {}",
                    metadata.info.name,
                    filter.name()
                );
                return false;
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.project.is_empty()
            && self.release.is_empty()
            && self.release_file.is_empty()
            && self.metadata.is_empty()
    }

    pub fn add_project(&mut self, filter: Arc<dyn ProjectFilter>) {
        self.project.push(filter);
    }

    pub fn add_release(&mut self, filter: Arc<dyn ReleaseFilter>) {
        self.release.push(filter);
    }

    pub fn add_release_file(&mut self, filter: Arc<dyn ReleaseFileFilter>) {
        self.release_file.push(filter);
    }

    pub fn add_metadata(&mut self, filter: Arc<dyn MetadataFilter>) {
        self.metadata.push(filter);
    }
}

/// Build the pipeline from configuration. Every name in `filters.enabled`
/// must resolve; a typo here should stop the process, not silently widen
/// the mirror.
pub fn build_pipeline(config: &Config) -> Result<FilterPipeline> {
    let mut pipeline = FilterPipeline::default();
    let filters = &config.filters;

    for name in &filters.enabled {
        match name.as_str() {
            "allowlist_project" => pipeline.add_project(Arc::new(
                allowdeny::AllowlistProject::new(&filters.allowlist.packages),
            )),
            "denylist_project" => pipeline.add_project(Arc::new(
                allowdeny::DenylistProject::new(&filters.denylist.packages),
            )),
            "allowlist_release" => pipeline.add_release(Arc::new(
                allowdeny::AllowlistRelease::new(&filters.allowlist.packages),
            )),
            "denylist_release" => pipeline.add_release(Arc::new(
                allowdeny::DenylistRelease::new(&filters.denylist.packages),
            )),
            "regex_project" => pipeline.add_project(Arc::new(regex::RegexProjectFilter::deny(
                &filters.denylist.project_regex,
            )?)),
            "regex_project_allow" => pipeline.add_project(Arc::new(
                regex::RegexProjectFilter::allow(&filters.allowlist.project_regex)?,
            )),
            "regex_release" => pipeline.add_release(Arc::new(regex::RegexReleaseFilter::new(
                &filters.denylist.release_regex,
            )?)),
            "prerelease" => pipeline.add_release(Arc::new(prerelease::PrereleaseFilter::new())),
            "latest_release" => pipeline.add_release(Arc::new(latest::LatestReleaseFilter::new(
                filters.latest_release.keep,
                filters.latest_release.sort_by == "time",
            ))),
            "platform" => pipeline.add_release_file(Arc::new(platform::PlatformFilter::new(
                &filters.platform.denied,
            ))),
            "size" => {
                let max = config
                    .max_package_size_bytes()
                    .ok_or_else(|| anyhow!("size filter enabled without max_package_size"))?;
                pipeline.add_metadata(Arc::new(size::SizeFilter::new(
                    max,
                    &filters.size.allowlist,
                )));
            }
            other => return Err(anyhow!("unknown filter: {}", other)),
        }
    }

    Ok(pipeline)
}
