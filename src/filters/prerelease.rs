//! Prerelease filter
//!
//! Denies versions carrying the conventional pre-release suffixes: rc,
//! alpha, beta and dev builds.

use std::sync::OnceLock;

use regex::Regex;

use crate::metadata::ProjectMetadata;

use super::ReleaseFilter;

fn prerelease_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i).+rc\d+$",
            r"(?i).+a(lpha)?\d+$",
            r"(?i).+b(eta)?\d+$",
            r"(?i).+dev\d+$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("prerelease patterns are valid"))
        .collect()
    })
}

#[derive(Default)]
pub struct PrereleaseFilter;

impl PrereleaseFilter {
    pub fn new() -> Self {
        PrereleaseFilter
    }
}

impl ReleaseFilter for PrereleaseFilter {
    fn name(&self) -> &'static str {
        "prerelease"
    }

    fn filter_releases(&self, metadata: &mut ProjectMetadata) {
        metadata
            .releases
            .retain(|version, _| !prerelease_patterns().iter().any(|p| p.is_match(version)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tests::metadata_with_versions;

    #[test]
    fn test_prerelease_versions_are_removed() {
        let filter = PrereleaseFilter::new();
        let mut meta = metadata_with_versions(
            "foo",
            &[
                "1.0", "2.0rc1", "2.0a1", "2.0alpha2", "2.0b3", "2.0beta4", "2.0.dev5", "2.0",
            ],
        );
        filter.filter_releases(&mut meta);
        assert_eq!(
            meta.releases.keys().cloned().collect::<Vec<_>>(),
            vec!["1.0", "2.0"]
        );
    }

    #[test]
    fn test_case_insensitive_matching() {
        let filter = PrereleaseFilter::new();
        let mut meta = metadata_with_versions("foo", &["1.0RC1", "1.0"]);
        filter.filter_releases(&mut meta);
        assert_eq!(
            meta.releases.keys().cloned().collect::<Vec<_>>(),
            vec!["1.0"]
        );
    }

    #[test]
    fn test_release_versions_survive() {
        let filter = PrereleaseFilter::new();
        let mut meta = metadata_with_versions("foo", &["1.0", "1.0.post1", "10.2.1"]);
        filter.filter_releases(&mut meta);
        assert_eq!(meta.releases.len(), 3);
    }
}
