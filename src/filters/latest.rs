//! Latest-N release retention filter
//!
//! Keeps the N most recent versions by parsed-version ordering (or upload
//! time when configured), always additionally keeping the version the
//! project metadata flags as current. Holds no per-project state, so one
//! instance is safe to reuse across every project in a run.

use chrono::DateTime;

use crate::metadata::ProjectMetadata;
use crate::version::Version;

use super::ReleaseFilter;

pub struct LatestReleaseFilter {
    keep: usize,
    by_time: bool,
}

impl LatestReleaseFilter {
    pub fn new(keep: usize, by_time: bool) -> Self {
        Self { keep, by_time }
    }

    fn version_key(version: &str) -> (u8, Option<Version>, String) {
        match Version::parse(version) {
            // Unparseable versions sort below everything parseable.
            Some(parsed) => (1, Some(parsed), version.to_string()),
            None => (0, None, version.to_string()),
        }
    }

    fn time_key(metadata: &ProjectMetadata, version: &str) -> i64 {
        metadata.releases[version]
            .iter()
            .filter_map(|f| f.upload_time_iso_8601.as_deref())
            .filter_map(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp())
            .max()
            .unwrap_or(0)
    }
}

impl ReleaseFilter for LatestReleaseFilter {
    fn name(&self) -> &'static str {
        "latest_release"
    }

    fn filter_releases(&self, metadata: &mut ProjectMetadata) {
        if self.keep == 0 || metadata.releases.len() <= self.keep {
            return;
        }

        let mut versions: Vec<String> = metadata.releases.keys().cloned().collect();
        if self.by_time {
            versions.sort_by_key(|v| Self::time_key(metadata, v));
        } else {
            versions.sort_by(|a, b| Self::version_key(a).cmp(&Self::version_key(b)));
        }

        let mut retained: Vec<String> = versions.split_off(versions.len() - self.keep);

        // The flagged-stable version stays even when it falls outside the
        // retained window.
        if let Some(stable) = metadata.info.version.clone() {
            if metadata.releases.contains_key(&stable) && !retained.contains(&stable) {
                retained.push(stable);
            }
        }

        metadata
            .releases
            .retain(|version, _| retained.contains(version));
    }
}
