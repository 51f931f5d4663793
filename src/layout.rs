//! On-disk replica layout
//!
//! One place owns every path in the mirror tree:
//!
//! ```text
//! <root>/status                     last fully applied serial
//! <root>/generation                 schema generation tag
//! <root>/todo                       in-progress run record
//! <root>/.lock                      writer exclusion marker
//! <root>/web/last-modified          timestamp of the last finalized run
//! <root>/web/simple/<name>/         per-project index pages
//! <root>/web/json/<name>            raw upstream metadata
//! <root>/web/pypi/<name>/json       legacy metadata alias
//! <root>/web/packages/...           release file blobs
//! ```
//!
//! With `hash_index` enabled the per-project simple directories gain a
//! first-character bucket (`web/simple/f/foo/`) so one directory never has
//! to hold every project on filesystems that degrade at that scale.

use std::path::{Path, PathBuf};

use crate::metadata::ReleaseFile;
use crate::storage::HashAlgo;

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    hash_index: bool,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, hash_index: bool) -> Self {
        Layout {
            root: root.into(),
            hash_index,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_index(&self) -> bool {
        self.hash_index
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join("status")
    }

    pub fn generation_path(&self) -> PathBuf {
        self.root.join("generation")
    }

    pub fn todo_path(&self) -> PathBuf {
        self.root.join("todo")
    }

    pub fn web_dir(&self) -> PathBuf {
        self.root.join("web")
    }

    pub fn last_modified_path(&self) -> PathBuf {
        self.web_dir().join("last-modified")
    }

    pub fn simple_root(&self) -> PathBuf {
        self.web_dir().join("simple")
    }

    /// Per-project simple directory for an already-normalized name.
    pub fn simple_dir(&self, normalized: &str) -> PathBuf {
        let root = self.simple_root();
        if self.hash_index {
            let bucket = normalized.chars().next().unwrap_or('_').to_string();
            root.join(bucket).join(normalized)
        } else {
            root.join(normalized)
        }
    }

    pub fn simple_html(&self, normalized: &str) -> PathBuf {
        self.simple_dir(normalized).join("index.html")
    }

    pub fn simple_json(&self, normalized: &str) -> PathBuf {
        self.simple_dir(normalized).join("index.v1_json")
    }

    pub fn global_index_html(&self) -> PathBuf {
        self.simple_root().join("index.html")
    }

    pub fn global_index_json(&self) -> PathBuf {
        self.simple_root().join("index.v1_json")
    }

    pub fn json_path(&self, normalized: &str) -> PathBuf {
        self.web_dir().join("json").join(normalized)
    }

    pub fn legacy_json_path(&self, normalized: &str) -> PathBuf {
        self.web_dir().join("pypi").join(normalized).join("json")
    }

    pub fn packages_root(&self) -> PathBuf {
        self.web_dir().join("packages")
    }

    /// Blob path for a release file. The upstream URL's tail after
    /// `packages/` is reused verbatim so the mirror tree matches upstream;
    /// URLs without that shape fall back to digest bucketing.
    pub fn blob_path(&self, file: &ReleaseFile) -> PathBuf {
        if let Some(tail) = file.url.split("/packages/").nth(1) {
            let segments: Vec<&str> = tail
                .split('/')
                .filter(|s| !s.is_empty() && *s != "." && *s != "..")
                .collect();
            if !segments.is_empty() {
                let mut path = self.packages_root();
                for segment in segments {
                    path.push(segment);
                }
                return path;
            }
        }
        let digest = file
            .digest()
            .map(|(_, hash)| hash.to_string())
            .unwrap_or_else(|| HashAlgo::Sha256.digest(file.url.as_bytes()));
        self.packages_root()
            .join(&digest[..2.min(digest.len())])
            .join(&digest[2..4.min(digest.len())])
            .join(&digest[4..12.min(digest.len())])
            .join(&file.filename)
    }

    /// Relative href from a project's simple page to a blob.
    pub fn relative_blob_href(&self, blob: &Path) -> String {
        let tail = blob
            .strip_prefix(self.web_dir())
            .unwrap_or(blob)
            .to_string_lossy()
            .replace('\\', "/");
        // Simple pages live two (or three, sharded) levels below web/.
        let ups = if self.hash_index { "../../../" } else { "../../" };
        format!("{ups}{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ReleaseFile;
    use std::collections::BTreeMap;

    fn file_with_url(url: &str) -> ReleaseFile {
        ReleaseFile {
            filename: "foo-1.0.tar.gz".to_string(),
            url: url.to_string(),
            size: 0,
            digests: BTreeMap::from([(
                "sha256".to_string(),
                "abcdef0123456789".to_string(),
            )]),
            requires_python: None,
            yanked: false,
            yanked_reason: None,
            packagetype: "sdist".to_string(),
            upload_time_iso_8601: None,
        }
    }

    #[test]
    fn test_simple_dir_flat_and_sharded() {
        let flat = Layout::new("/m", false);
        assert_eq!(flat.simple_dir("foo"), PathBuf::from("/m/web/simple/foo"));

        let sharded = Layout::new("/m", true);
        assert_eq!(
            sharded.simple_dir("foo"),
            PathBuf::from("/m/web/simple/f/foo")
        );
    }

    #[test]
    fn test_blob_path_from_url_tail() {
        let layout = Layout::new("/m", false);
        let file =
            file_with_url("https://files.example.org/packages/aa/bb/ccdd/foo-1.0.tar.gz");
        assert_eq!(
            layout.blob_path(&file),
            PathBuf::from("/m/web/packages/aa/bb/ccdd/foo-1.0.tar.gz")
        );
    }

    #[test]
    fn test_blob_path_fallback_buckets_by_digest() {
        let layout = Layout::new("/m", false);
        let file = file_with_url("https://cdn.example.org/dl/foo-1.0.tar.gz");
        assert_eq!(
            layout.blob_path(&file),
            PathBuf::from("/m/web/packages/ab/cd/ef012345/foo-1.0.tar.gz")
        );
    }

    #[test]
    fn test_blob_path_rejects_traversal_segments() {
        let layout = Layout::new("/m", false);
        let file = file_with_url("https://files.example.org/packages/../../../etc/passwd");
        let path = layout.blob_path(&file);
        assert!(path.starts_with("/m/web/packages"));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_relative_blob_href() {
        let layout = Layout::new("/m", false);
        let blob = PathBuf::from("/m/web/packages/aa/bb/foo-1.0.tar.gz");
        assert_eq!(
            layout.relative_blob_href(&blob),
            "../../packages/aa/bb/foo-1.0.tar.gz"
        );

        let sharded = Layout::new("/m", true);
        assert_eq!(
            sharded.relative_blob_href(&blob),
            "../../../packages/aa/bb/foo-1.0.tar.gz"
        );
    }

    #[test]
    fn test_state_file_paths() {
        let layout = Layout::new("/m", false);
        assert_eq!(layout.status_path(), PathBuf::from("/m/status"));
        assert_eq!(layout.todo_path(), PathBuf::from("/m/todo"));
        assert_eq!(layout.lock_path(), PathBuf::from("/m/.lock"));
        assert_eq!(
            layout.legacy_json_path("foo"),
            PathBuf::from("/m/web/pypi/foo/json")
        );
    }
}
