//! Upstream project metadata model
//!
//! Typed view over the JSON document the upstream serves per project. The
//! raw document is kept alongside the typed fields so the mirror can
//! republish it byte-faithfully under `web/json/<name>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Free-form project attributes. Only the fields the sync logic needs are
/// typed; everything else rides along in the raw document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: String,

    /// The version upstream flags as current/stable for the project.
    #[serde(default)]
    pub version: Option<String>,
}

/// One downloadable artifact of a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub filename: String,
    pub url: String,

    #[serde(default)]
    pub size: u64,

    /// Digest map; at least one of md5/sha256 in practice.
    #[serde(default)]
    pub digests: BTreeMap<String, String>,

    #[serde(default)]
    pub requires_python: Option<String>,

    #[serde(default)]
    pub yanked: bool,

    #[serde(default)]
    pub yanked_reason: Option<String>,

    /// sdist, bdist_wheel, bdist_egg, ...
    #[serde(default)]
    pub packagetype: String,

    #[serde(default)]
    pub upload_time_iso_8601: Option<String>,
}

impl ReleaseFile {
    /// Preferred digest for verification: sha256 when declared, else md5.
    pub fn digest(&self) -> Option<(&str, &str)> {
        for algo in ["sha256", "md5"] {
            if let Some(hash) = self.digests.get(algo) {
                return Some((algo, hash.as_str()));
            }
        }
        None
    }

    /// Digest value for a specific algorithm, if declared.
    pub fn digest_for(&self, algo: &str) -> Option<&str> {
        self.digests.get(algo).map(String::as_str)
    }
}

/// Full per-project metadata document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default)]
    pub info: ProjectInfo,

    #[serde(default)]
    pub last_serial: u64,

    /// Version string -> files published for that version. Ordering of the
    /// map is irrelevant to consumers; `BTreeMap` keeps runs deterministic.
    #[serde(default)]
    pub releases: BTreeMap<String, Vec<ReleaseFile>>,
}

impl ProjectMetadata {
    /// Every file referenced across all remaining releases, deduplicated by
    /// filename (the same artifact may be listed under several versions).
    pub fn all_files(&self) -> Vec<&ReleaseFile> {
        let mut seen = std::collections::BTreeSet::new();
        let mut files = Vec::new();
        for release in self.releases.values() {
            for file in release {
                if seen.insert(file.filename.as_str()) {
                    files.push(file);
                }
            }
        }
        files
    }

    /// Total declared size of all remaining release files.
    pub fn total_size(&self) -> u64 {
        self.all_files().iter().map(|f| f.size).sum()
    }
}
