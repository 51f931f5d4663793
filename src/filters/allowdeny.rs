//! Allow/deny list filters
//!
//! List entries are either a bare project name (`requests`) or a name with
//! a PEP 440 specifier (`requests==2.31.0`, `django~=4.0,<4.2`). Bare
//! names act at the project level, specifier entries at the release level.
//! Matching is case-insensitive and name-normalized, and `#` comments
//! (whole-line or inline) are ignored.

use std::collections::{BTreeMap, BTreeSet};

use crate::metadata::ProjectMetadata;
use crate::version::{normalize, split_requirement, SpecifierSet};

use super::{ProjectFilter, ReleaseFilter};

/// Parsed form of a package list shared by the four list filters.
#[derive(Debug, Default)]
struct PackageList {
    /// Normalized names of bare entries.
    bare: BTreeSet<String>,
    /// All normalized entry names, bare or specified.
    all: BTreeSet<String>,
    /// Specifier entries grouped by normalized name.
    specifiers: BTreeMap<String, Vec<SpecifierSet>>,
}

impl PackageList {
    fn parse(entries: &[String]) -> Self {
        let mut list = PackageList::default();
        for raw in entries {
            let line = match raw.split_once('#') {
                Some((before, _comment)) => before,
                None => raw.as_str(),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, specs) = split_requirement(line);
            if name.is_empty() {
                continue;
            }
            let name = normalize(&name);
            list.all.insert(name.clone());
            match specs {
                Some(specs) => list.specifiers.entry(name).or_default().push(specs),
                None => {
                    list.bare.insert(name);
                }
            }
        }
        list
    }
}

/// Admit only projects named in the allowlist.
pub struct AllowlistProject {
    list: PackageList,
}

impl AllowlistProject {
    pub fn new(entries: &[String]) -> Self {
        Self {
            list: PackageList::parse(entries),
        }
    }
}

impl ProjectFilter for AllowlistProject {
    fn name(&self) -> &'static str {
        "allowlist_project"
    }

    fn admits(&self, normalized: &str) -> bool {
        // An empty list means the filter is configured but inert.
        self.list.all.is_empty() || self.list.all.contains(normalized)
    }
}

/// Deny projects named bare in the denylist.
pub struct DenylistProject {
    list: PackageList,
}

impl DenylistProject {
    pub fn new(entries: &[String]) -> Self {
        Self {
            list: PackageList::parse(entries),
        }
    }
}

impl ProjectFilter for DenylistProject {
    fn name(&self) -> &'static str {
        "denylist_project"
    }

    fn admits(&self, normalized: &str) -> bool {
        !self.list.bare.contains(normalized)
    }
}

/// For projects with specifier entries in the allowlist, keep only the
/// versions matching at least one of them.
pub struct AllowlistRelease {
    list: PackageList,
}

impl AllowlistRelease {
    pub fn new(entries: &[String]) -> Self {
        Self {
            list: PackageList::parse(entries),
        }
    }
}

impl ReleaseFilter for AllowlistRelease {
    fn name(&self) -> &'static str {
        "allowlist_release"
    }

    fn filter_releases(&self, metadata: &mut ProjectMetadata) {
        let project = normalize(&metadata.info.name);
        let Some(specs) = self.list.specifiers.get(&project) else {
            return;
        };
        metadata
            .releases
            .retain(|version, _| specs.iter().any(|s| s.matches(version)));
    }
}

/// Remove versions matching any specifier entry in the denylist.
pub struct DenylistRelease {
    list: PackageList,
}

impl DenylistRelease {
    pub fn new(entries: &[String]) -> Self {
        Self {
            list: PackageList::parse(entries),
        }
    }
}

impl ReleaseFilter for DenylistRelease {
    fn name(&self) -> &'static str {
        "denylist_release"
    }

    fn filter_releases(&self, metadata: &mut ProjectMetadata) {
        let project = normalize(&metadata.info.name);
        let Some(specs) = self.list.specifiers.get(&project) else {
            return;
        };
        metadata
            .releases
            .retain(|version, _| !specs.iter().any(|s| s.matches(version)));
    }
}
