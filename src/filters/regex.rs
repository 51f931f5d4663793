//! Regex-based project and release filters
//!
//! Deny semantics by default: anything matching any configured pattern is
//! excluded. The allow-style variant inverts the sense and admits only
//! matching projects.

use anyhow::{Context, Result};
use regex::Regex;

use crate::metadata::ProjectMetadata;

use super::{ProjectFilter, ReleaseFilter};

pub struct RegexProjectFilter {
    patterns: Vec<Regex>,
    allow: bool,
}

impl RegexProjectFilter {
    pub fn deny(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: compile(patterns)?,
            allow: false,
        })
    }

    pub fn allow(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: compile(patterns)?,
            allow: true,
        })
    }
}

impl ProjectFilter for RegexProjectFilter {
    fn name(&self) -> &'static str {
        if self.allow {
            "regex_project_allow"
        } else {
            "regex_project"
        }
    }

    fn admits(&self, normalized: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let matched = self.patterns.iter().any(|p| p.is_match(normalized));
        if self.allow {
            matched
        } else {
            !matched
        }
    }
}

/// Remove versions whose version string matches any pattern.
pub struct RegexReleaseFilter {
    patterns: Vec<Regex>,
}

impl RegexReleaseFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: compile(patterns)?,
        })
    }
}

impl ReleaseFilter for RegexReleaseFilter {
    fn name(&self) -> &'static str {
        "regex_release"
    }

    fn filter_releases(&self, metadata: &mut ProjectMetadata) {
        if self.patterns.is_empty() {
            return;
        }
        metadata
            .releases
            .retain(|version, _| !self.patterns.iter().any(|p| p.is_match(version)));
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid filter pattern: {p}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tests::metadata_with_versions;

    #[test]
    fn test_deny_matching_projects() {
        let filter =
            RegexProjectFilter::deny(&["^test-".to_string(), ".*-nightly$".to_string()]).unwrap();
        assert!(!filter.admits("test-helpers"));
        assert!(!filter.admits("builds-nightly"));
        assert!(filter.admits("requests"));
    }

    #[test]
    fn test_allow_inverts_the_sense() {
        let filter = RegexProjectFilter::allow(&["^django-".to_string()]).unwrap();
        assert!(filter.admits("django-rest"));
        assert!(!filter.admits("flask"));
    }

    #[test]
    fn test_no_patterns_admits_everything() {
        let filter = RegexProjectFilter::deny(&[]).unwrap();
        assert!(filter.admits("anything"));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        assert!(RegexProjectFilter::deny(&["(unclosed".to_string()]).is_err());
    }

    #[test]
    fn test_release_versions_matching_any_pattern_are_removed() {
        let filter = RegexReleaseFilter::new(&[r"\.99$".to_string()]).unwrap();
        let mut meta = metadata_with_versions("foo", &["1.0", "1.99", "2.0"]);
        filter.filter_releases(&mut meta);
        assert_eq!(
            meta.releases.keys().cloned().collect::<Vec<_>>(),
            vec!["1.0", "2.0"]
        );
    }
}
