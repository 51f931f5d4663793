//! Platform and packagetype exclusion filter
//!
//! Denies binary files whose filename carries a denied platform tag, or
//! whose package type is explicitly denied. Source distributions are never
//! excluded: an sdist is platform-neutral no matter what its name says.

use crate::metadata::ReleaseFile;

use super::ReleaseFileFilter;

/// Known package types that a denied entry can name directly.
const PACKAGE_TYPES: &[&str] = &["bdist_wheel", "bdist_egg", "bdist_wininst", "bdist_msi"];

pub struct PlatformFilter {
    filename_patterns: Vec<String>,
    denied_packagetypes: Vec<String>,
}

impl PlatformFilter {
    pub fn new(denied: &[String]) -> Self {
        let mut filename_patterns = Vec::new();
        let mut denied_packagetypes = Vec::new();

        for entry in denied {
            let tag = entry.trim().to_lowercase();
            if tag.is_empty() {
                continue;
            }
            if PACKAGE_TYPES.contains(&tag.as_str()) {
                denied_packagetypes.push(tag);
                continue;
            }
            match tag.as_str() {
                "windows" | "win" => {
                    filename_patterns.extend(
                        ["-win32", ".win32", "win_amd64", "win-amd64", "win_arm64"]
                            .iter()
                            .map(|s| s.to_string()),
                    );
                    denied_packagetypes.extend(
                        ["bdist_wininst", "bdist_msi"].iter().map(|s| s.to_string()),
                    );
                }
                "macos" | "macosx" => {
                    filename_patterns
                        .extend(["macosx_", "-macosx"].iter().map(|s| s.to_string()));
                }
                "freebsd" => {
                    filename_patterns.push("-freebsd".to_string());
                }
                "linux" => {
                    filename_patterns.extend(
                        ["linux_i686", "linux_x86_64", "manylinux", "musllinux"]
                            .iter()
                            .map(|s| s.to_string()),
                    );
                }
                // Specific tags (linux-armv6l, linux_armv7l, ...) match the
                // wheel filename convention directly.
                other => filename_patterns.push(other.replace('-', "_")),
            }
        }

        Self {
            filename_patterns,
            denied_packagetypes,
        }
    }
}

impl ReleaseFileFilter for PlatformFilter {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn admits(&self, _version: &str, file: &ReleaseFile) -> bool {
        if file.packagetype == "sdist" {
            return true;
        }
        if self
            .denied_packagetypes
            .iter()
            .any(|t| t == &file.packagetype)
        {
            return false;
        }
        let filename = file.filename.to_lowercase();
        !self
            .filename_patterns
            .iter()
            .any(|pattern| filename.contains(pattern))
    }
}
