//! Upstream index client
//!
//! Owns the wire shape of the four operations the mirror consumes:
//! listing all projects with serials, the changelog feed since a serial,
//! per-project metadata at a required serial, and raw file bytes. Nothing
//! outside this module knows what the upstream's JSON looks like.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::SyncError;
use crate::metadata::ProjectMetadata;
use crate::storage::HashAlgo;

const SIMPLE_JSON_ACCEPT: &str = "application/vnd.pypi.simple.v1+json";

/// HTTP client wrapper for one upstream index.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    /// Create a client from the mirror configuration.
    pub fn new(config: &Config) -> Result<Self> {
        Self::for_url(&config.mirror.upstream_url, config.request_timeout())
    }

    pub fn for_url(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("pymirror/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List every project upstream knows, with the serial of its latest
    /// change. Used for full syncs of a fresh replica.
    pub async fn list_projects(&self) -> Result<BTreeMap<String, u64>, SyncError> {
        let url = format!("{}/simple/", self.base_url);
        debug!("listing all projects from {}", url);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, SIMPLE_JSON_ACCEPT)
            .send()
            .await?
            .error_for_status()?;

        let doc: Value = response.json().await?;
        let index_serial = doc
            .pointer("/meta/_last-serial")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut projects = BTreeMap::new();
        for entry in doc
            .pointer("/projects")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                warn!("skipping index entry without a name: {entry}");
                continue;
            };
            let serial = entry
                .get("_last-serial")
                .and_then(Value::as_u64)
                .unwrap_or(index_serial);
            projects.insert(name.to_string(), serial);
        }

        debug!("upstream lists {} projects", projects.len());
        Ok(projects)
    }

    /// Ordered change events since `serial`. Entries are arrays whose first
    /// string is the project name and whose last integer is the serial;
    /// intermediate fields vary by upstream and are ignored.
    pub async fn changelog_since(&self, serial: u64) -> Result<Vec<(String, u64)>, SyncError> {
        let url = format!("{}/pypi/changelog/{}", self.base_url, serial);
        debug!("fetching changelog since serial {}", serial);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let doc: Value = response.json().await?;

        let mut events = Vec::new();
        for entry in doc.as_array().into_iter().flatten() {
            let Some(fields) = entry.as_array() else {
                continue;
            };
            let name = fields.iter().find_map(Value::as_str);
            let event_serial = fields.iter().rev().find_map(Value::as_u64);
            if let (Some(name), Some(event_serial)) = (name, event_serial) {
                events.push((name.to_string(), event_serial));
            }
        }
        Ok(events)
    }

    /// Project metadata at `required_serial`. An upstream still serving an
    /// older serial is a lag condition the caller retries with backoff.
    pub async fn fetch_metadata(
        &self,
        name: &str,
        required_serial: u64,
    ) -> Result<(Value, ProjectMetadata), SyncError> {
        let url = format!("{}/pypi/{}/json", self.base_url, name);
        debug!("fetching metadata for {} at serial {}", name, required_serial);

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(name.to_string()));
        }
        let response = response.error_for_status()?;

        let raw: Value = response.json().await?;
        let metadata: ProjectMetadata =
            serde_json::from_value(raw.clone()).map_err(|e| SyncError::Malformed {
                package: name.to_string(),
                reason: e.to_string(),
            })?;

        if metadata.info.name.is_empty() {
            return Err(SyncError::Malformed {
                package: name.to_string(),
                reason: "missing info.name".to_string(),
            });
        }

        if required_serial > 0 && metadata.last_serial < required_serial {
            return Err(SyncError::StaleSerial {
                package: name.to_string(),
                have: metadata.last_serial,
                need: required_serial,
            });
        }

        Ok((raw, metadata))
    }

    /// Download a file, hashing while streaming. Returns the bytes and the
    /// hex digest under `algo` so the caller can verify before publishing.
    pub async fn download(
        &self,
        url: &str,
        algo: HashAlgo,
    ) -> Result<(Vec<u8>, String), SyncError> {
        debug!("downloading {}", url);
        let mut response = self.client.get(url).send().await?.error_for_status()?;

        let mut hasher = algo.hasher();
        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }
        Ok((body, hasher.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> UpstreamClient {
        UpstreamClient::for_url(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_projects_with_serials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/"))
            .and(header("accept", SIMPLE_JSON_ACCEPT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "meta": {"api-version": "1.1", "_last-serial": 20},
                "projects": [
                    {"name": "foo", "_last-serial": 12},
                    {"name": "bar"},
                ],
            })))
            .mount(&server)
            .await;

        let projects = client_for(&server).await.list_projects().await.unwrap();
        assert_eq!(projects["foo"], 12);
        // Entries without their own serial inherit the index serial.
        assert_eq!(projects["bar"], 20);
    }

    #[tokio::test]
    async fn test_changelog_parses_liberal_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pypi/changelog/10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                ["foo", "1.0", 1700000000, "new release", 11],
                ["bar", 12],
            ])))
            .mount(&server)
            .await;

        let events = client_for(&server)
            .await
            .changelog_since(10)
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![("foo".to_string(), 11), ("bar".to_string(), 12)]
        );
    }

    #[tokio::test]
    async fn test_fetch_metadata_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pypi/gone/json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .fetch_metadata("gone", 1)
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::NotFound(name) if name == "gone");
    }

    #[tokio::test]
    async fn test_fetch_metadata_stale_serial_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pypi/foo/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "info": {"name": "foo", "version": "1.0"},
                "last_serial": 9,
                "releases": {},
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .fetch_metadata("foo", 12)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_matches!(err, SyncError::StaleSerial { have: 9, need: 12, .. });
    }

    #[tokio::test]
    async fn test_fetch_metadata_malformed_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pypi/foo/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "info": "not an object",
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .fetch_metadata("foo", 1)
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::Malformed { .. });
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_download_streams_and_hashes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/packages/aa/bb/foo-1.0.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tarball".to_vec()))
            .mount(&server)
            .await;

        let url = format!("{}/packages/aa/bb/foo-1.0.tar.gz", server.uri());
        let (bytes, digest) = client_for(&server)
            .await
            .download(&url, HashAlgo::Sha256)
            .await
            .unwrap();
        assert_eq!(bytes, b"tarball");
        assert_eq!(digest, HashAlgo::Sha256.digest(b"tarball"));
    }
}
