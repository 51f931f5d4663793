/// Common test utilities and helpers for pymirror integration tests
///
/// Builds a mirror rooted in a temp directory pointed at a wiremock
/// upstream, plus helpers to register the upstream endpoints the engine
/// consumes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pymirror::storage::HashAlgo;
use pymirror::Config;

/// One mirror under test: temp replica directory + mock upstream.
pub struct TestMirror {
    pub server: MockServer,
    pub dir: TempDir,
    pub config: Config,
}

impl TestMirror {
    pub async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("Failed to create temp dir");

        let mut config = Config::default();
        config.mirror.directory = dir.path().to_string_lossy().to_string();
        config.mirror.upstream_url = server.uri();
        config.mirror.workers = 2;
        config.mirror.timeout = 5;
        config.mirror.lock_timeout = 1;

        Self {
            server,
            dir,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn read_file(&self, relative: &str) -> String {
        std::fs::read_to_string(self.root().join(relative))
            .unwrap_or_else(|e| panic!("failed to read {relative}: {e}"))
    }

    pub fn file_exists(&self, relative: &str) -> bool {
        self.root().join(relative).exists()
    }

    /// Register the full project listing endpoint.
    pub async fn mock_listing(&self, projects: &[(&str, u64)]) {
        let last_serial = projects.iter().map(|(_, s)| *s).max().unwrap_or(0);
        let entries: Vec<Value> = projects
            .iter()
            .map(|(name, serial)| json!({"name": name, "_last-serial": serial}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/simple/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "meta": {"api-version": "1.1", "_last-serial": last_serial},
                "projects": entries,
            })))
            .mount(&self.server)
            .await;
    }

    /// Register the changelog feed since `serial`.
    pub async fn mock_changelog(&self, since: u64, events: &[(&str, u64)]) {
        let body: Vec<Value> = events
            .iter()
            .map(|(name, serial)| json!([name, "1.0", 1700000000u64, "new release", serial]))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/pypi/changelog/{since}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(body)))
            .mount(&self.server)
            .await;
    }

    /// Register a project metadata document.
    pub async fn mock_metadata(&self, name: &str, doc: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/pypi/{name}/json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc))
            .mount(&self.server)
            .await;
    }

    /// Register a blob download.
    pub async fn mock_blob(&self, blob_path: &str, bytes: &[u8]) {
        Mock::given(method("GET"))
            .and(path(blob_path.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.to_vec()))
            .mount(&self.server)
            .await;
    }

    /// Metadata document for a project with one sdist per version, whose
    /// declared digests match `bytes`.
    pub fn sdist_doc(&self, name: &str, versions: &[&str], serial: u64, bytes: &[u8]) -> Value {
        let digest = HashAlgo::Sha256.digest(bytes);
        let mut releases = serde_json::Map::new();
        for version in versions {
            releases.insert(
                version.to_string(),
                json!([{
                    "filename": format!("{name}-{version}.tar.gz"),
                    "url": format!(
                        "{}/packages/aa/bb/{name}-{version}.tar.gz",
                        self.server.uri()
                    ),
                    "size": bytes.len(),
                    "digests": {"sha256": digest},
                    "requires_python": ">=3.8",
                    "packagetype": "sdist",
                    "yanked": false,
                    "upload_time_iso_8601": "2024-03-01T10:00:00.000000+00:00"
                }]),
            );
        }
        json!({
            "info": {"name": name, "version": versions.last().copied().unwrap_or("0")},
            "last_serial": serial,
            "releases": releases,
        })
    }
}

/// Snapshot of a file tree: relative path -> content bytes. Used to prove
/// idempotence and crash-resume equivalence byte-for-byte.
pub fn tree_snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut snapshot = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).expect("read_dir failed") {
            let entry = entry.expect("dir entry failed");
            let entry_path = entry.path();
            if entry_path.is_dir() {
                pending.push(entry_path);
            } else {
                let relative = entry_path.strip_prefix(root).unwrap().to_path_buf();
                // The lock marker comes and goes with each run.
                if relative == Path::new(".lock") {
                    continue;
                }
                snapshot.insert(relative, std::fs::read(&entry_path).expect("read failed"));
            }
        }
    }
    snapshot
}
