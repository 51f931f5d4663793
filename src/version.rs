//! Project name normalization and version handling
//!
//! Implements the name normalization rules the index file tree depends on
//! (PEP 503 plus the legacy variant older clients were given), a lenient
//! PEP 440 version parser with total ordering, and version specifier
//! matching used by the allow/deny filter lists.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;

/// Normalize a project name per PEP 503: lowercase, with runs of `-`, `_`
/// and `.` collapsed to a single `-`.
pub fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.chars() {
        if ch == '-' || ch == '_' || ch == '.' {
            if !last_dash {
                out.push('-');
                last_dash = true;
            }
        } else {
            out.extend(ch.to_lowercase());
            last_dash = false;
        }
    }
    out
}

/// The historical normalization older index layouts used: runs of anything
/// that is not alphanumeric or a dot become `-`, then lowercase. Differs
/// from [`normalize`] for dotted names like `zope.interface`.
pub fn legacy_normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' {
            out.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out
}

/// Pre-release phase tag, in PEP 440 ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreKind {
    Alpha,
    Beta,
    Rc,
}

/// A parsed version, ordered per PEP 440.
///
/// Parsing is lenient: versions the regex cannot make sense of are rejected
/// with `None` and callers fall back to string comparison where ordering is
/// still needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: u64,
    pub release: Vec<u64>,
    pub pre: Option<(PreKind, u64)>,
    pub post: Option<u64>,
    pub dev: Option<u64>,
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)^v?
              (?:(?P<epoch>\d+)!)?
              (?P<release>\d+(?:\.\d+)*)
              (?:[-._]?(?P<prekind>a|alpha|b|beta|c|rc|pre|preview)[-._]?(?P<pren>\d*))?
              (?:(?:[-._]?(?P<postkind>post|rev|r)[-._]?(?P<postn>\d*))|(?:-(?P<postimplicit>\d+)))?
              (?:[-._]?dev[-._]?(?P<devn>\d*))?
              (?:\+(?P<local>[a-z0-9]+(?:[-._][a-z0-9]+)*))?$",
        )
        .expect("version regex is valid")
    })
}

impl Version {
    /// Parse a version string. Returns `None` when the string does not
    /// resemble a PEP 440 version at all.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let caps = version_re().captures(&s)?;

        let epoch = caps
            .name("epoch")
            .map_or(Some(0), |m| m.as_str().parse().ok())?;
        let release = caps
            .name("release")?
            .as_str()
            .split('.')
            .map(|part| part.parse().ok())
            .collect::<Option<Vec<u64>>>()?;

        let pre = caps.name("prekind").map(|kind| {
            let kind = match kind.as_str() {
                "a" | "alpha" => PreKind::Alpha,
                "b" | "beta" => PreKind::Beta,
                _ => PreKind::Rc,
            };
            let n = caps
                .name("pren")
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            (kind, n)
        });

        let post = if caps.name("postkind").is_some() {
            Some(
                caps.name("postn")
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0),
            )
        } else {
            caps.name("postimplicit")
                .and_then(|m| m.as_str().parse().ok())
        };

        let dev = if s.contains("dev") {
            caps.name("devn")
                .map(|m| m.as_str().parse().unwrap_or(0))
        } else {
            None
        };

        Some(Version {
            epoch,
            release,
            pre,
            post,
            dev,
        })
    }

    /// True for alpha/beta/rc/dev versions.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    // Ordering key. Trailing zeros in the release are insignificant
    // (1.0 == 1.0.0). Phase ranks: dev-only < alpha < beta < rc < final,
    // with post-releases sorting after their base.
    fn key(&self) -> (u64, Vec<u64>, u8, u64, u8, u64, u8, u64) {
        let mut release = self.release.clone();
        while release.len() > 1 && release.last() == Some(&0) {
            release.pop();
        }
        let (phase, phase_n) = match self.pre {
            Some((PreKind::Alpha, n)) => (1, n),
            Some((PreKind::Beta, n)) => (2, n),
            Some((PreKind::Rc, n)) => (3, n),
            None if self.dev.is_some() && self.post.is_none() => (0, 0),
            None => (4, 0),
        };
        let (dev_rank, dev_n) = match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        };
        let (post_rank, post_n) = match self.post {
            Some(n) => (1, n),
            None => (0, 0),
        };
        (
            self.epoch, release, phase, phase_n, post_rank, post_n, dev_rank, dev_n,
        )
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Comparison operator of a single specifier clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Compatible,
}

#[derive(Debug, Clone)]
struct Clause {
    op: Op,
    version: String,
}

/// A comma-separated set of PEP 440 specifier clauses, e.g. `~=3.0,<=1.5`.
/// A version matches the set iff it matches every clause.
#[derive(Debug, Clone)]
pub struct SpecifierSet {
    clauses: Vec<Clause>,
}

impl SpecifierSet {
    pub fn parse(spec: &str) -> Option<Self> {
        let mut clauses = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (op, rest) = if let Some(rest) = part.strip_prefix("===") {
                (Op::Eq, rest)
            } else if let Some(rest) = part.strip_prefix("==") {
                (Op::Eq, rest)
            } else if let Some(rest) = part.strip_prefix("!=") {
                (Op::Ne, rest)
            } else if let Some(rest) = part.strip_prefix("<=") {
                (Op::Le, rest)
            } else if let Some(rest) = part.strip_prefix(">=") {
                (Op::Ge, rest)
            } else if let Some(rest) = part.strip_prefix("~=") {
                (Op::Compatible, rest)
            } else if let Some(rest) = part.strip_prefix('<') {
                (Op::Lt, rest)
            } else if let Some(rest) = part.strip_prefix('>') {
                (Op::Gt, rest)
            } else {
                return None;
            };
            clauses.push(Clause {
                op,
                version: rest.trim().to_string(),
            });
        }
        if clauses.is_empty() {
            None
        } else {
            Some(SpecifierSet { clauses })
        }
    }

    /// Check a version string against every clause.
    pub fn matches(&self, version: &str) -> bool {
        let Some(candidate) = Version::parse(version) else {
            // Unparseable versions only ever match exact equality.
            return self
                .clauses
                .iter()
                .all(|c| c.op == Op::Eq && c.version == version);
        };
        self.clauses.iter().all(|c| c.matches(&candidate, version))
    }
}

impl Clause {
    fn matches(&self, candidate: &Version, raw: &str) -> bool {
        match self.op {
            Op::Eq => {
                if let Some(prefix) = self.version.strip_suffix(".*") {
                    return raw.to_lowercase() == prefix.to_lowercase()
                        || raw.to_lowercase().starts_with(&format!("{}.", prefix.to_lowercase()));
                }
                match Version::parse(&self.version) {
                    Some(v) => *candidate == v,
                    None => raw == self.version,
                }
            }
            Op::Ne => match Version::parse(&self.version) {
                Some(v) => *candidate != v,
                None => raw != self.version,
            },
            Op::Le => Version::parse(&self.version).is_some_and(|v| *candidate <= v),
            Op::Ge => Version::parse(&self.version).is_some_and(|v| *candidate >= v),
            Op::Lt => Version::parse(&self.version).is_some_and(|v| *candidate < v),
            Op::Gt => Version::parse(&self.version).is_some_and(|v| *candidate > v),
            Op::Compatible => {
                // ~=X.Y is >=X.Y together with ==X.* (the last segment freed).
                let Some(floor) = Version::parse(&self.version) else {
                    return false;
                };
                if floor.release.len() < 2 || *candidate < floor {
                    return false;
                }
                let prefix = &floor.release[..floor.release.len() - 1];
                candidate.release.len() >= prefix.len() && &candidate.release[..prefix.len()] == prefix
            }
        }
    }
}

/// Split a filter-list entry like `name~=3.0,<=1.5` into the project name
/// and its optional specifier set. Bare names yield `None` specifiers.
pub fn split_requirement(entry: &str) -> (String, Option<SpecifierSet>) {
    let split_at = entry
        .find(|c| ['<', '>', '=', '!', '~'].contains(&c))
        .unwrap_or(entry.len());
    let (name, spec) = entry.split_at(split_at);
    let specifiers = if spec.is_empty() {
        None
    } else {
        SpecifierSet::parse(spec)
    };
    (name.trim().to_string(), specifiers)
}
