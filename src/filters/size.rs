//! Aggregate size cap filter
//!
//! Rejects a whole project when the summed size of its (post-filter)
//! release files exceeds the configured threshold, unless the project is
//! explicitly allow-listed.

use std::collections::BTreeSet;

use tracing::debug;

use crate::metadata::ProjectMetadata;
use crate::version::normalize;

use super::MetadataFilter;

pub struct SizeFilter {
    max_bytes: u64,
    allowlist: BTreeSet<String>,
}

impl SizeFilter {
    pub fn new(max_bytes: u64, allowlist: &[String]) -> Self {
        Self {
            max_bytes,
            allowlist: allowlist.iter().map(|n| normalize(n)).collect(),
        }
    }
}

impl MetadataFilter for SizeFilter {
    fn name(&self) -> &'static str {
        "size"
    }

    fn admits(&self, metadata: &ProjectMetadata) -> bool {
        if self.allowlist.contains(&normalize(&metadata.info.name)) {
            return true;
        }
        let total = metadata.total_size();
        if total > self.max_bytes {
            debug!(
                "project {} exceeds size cap: {} > {}",
                metadata.info.name, total, self.max_bytes
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tests::metadata_with_versions;

    #[test]
    fn test_projects_under_cap_are_admitted() {
        // Sample files are 100 bytes each.
        let filter = SizeFilter::new(250, &[]);
        let meta = metadata_with_versions("foo", &["1.0", "1.1"]);
        assert!(filter.admits(&meta));
    }

    #[test]
    fn test_projects_over_cap_are_rejected() {
        let filter = SizeFilter::new(250, &[]);
        let meta = metadata_with_versions("foo", &["1.0", "1.1", "1.2"]);
        assert!(!filter.admits(&meta));
    }

    #[test]
    fn test_allowlist_overrides_cap() {
        let filter = SizeFilter::new(1, &["Foo".to_string()]);
        let meta = metadata_with_versions("foo", &["1.0", "1.1", "1.2"]);
        assert!(filter.admits(&meta));
    }
}
