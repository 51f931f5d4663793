//! Index Page Generator - the replica's public file-based API
//!
//! Renders two interchangeable representations of a project's surviving
//! release set: the PEP 503 HTML page installers have consumed for years,
//! and the PEP 691 JSON document. The global index enumerates every known
//! project in both formats.
//!
//! Pages are pure functions of (metadata, serial): the package state
//! machine decides when to write them, the mirror engine when to refresh
//! the global index.

use serde_json::json;

use crate::layout::Layout;
use crate::metadata::{ProjectMetadata, ReleaseFile};
use crate::storage::HashAlgo;
use crate::version::Version;

/// Which representations get written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleFormat {
    Html,
    Json,
    All,
}

impl SimpleFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(SimpleFormat::Html),
            "json" => Some(SimpleFormat::Json),
            "all" => Some(SimpleFormat::All),
            _ => None,
        }
    }

    pub fn wants_html(&self) -> bool {
        matches!(self, SimpleFormat::Html | SimpleFormat::All)
    }

    pub fn wants_json(&self) -> bool {
        matches!(self, SimpleFormat::Json | SimpleFormat::All)
    }
}

/// Renders simple pages for one mirror configuration.
pub struct SimpleRenderer {
    layout: Layout,
    digest: HashAlgo,
    root_uri: String,
}

impl SimpleRenderer {
    pub fn new(layout: Layout, digest: HashAlgo, root_uri: impl Into<String>) -> Self {
        Self {
            layout,
            digest,
            root_uri: root_uri.into(),
        }
    }

    /// Per-project PEP 503 page. The trailing comment records the serial
    /// the page was generated at, a long-standing cache debugging aid.
    pub fn render_html(&self, metadata: &ProjectMetadata, serial: u64) -> String {
        let name = &metadata.info.name;
        let mut page = String::new();
        page.push_str("<!DOCTYPE html>\n<html>\n  <head>\n");
        page.push_str("    <meta name=\"pypi:repository-version\" content=\"1.0\">\n");
        page.push_str(&format!("    <title>Links for {}</title>\n", escape(name)));
        page.push_str("  </head>\n  <body>\n");
        page.push_str(&format!("    <h1>Links for {}</h1>\n", escape(name)));

        for file in self.sorted_files(metadata) {
            let mut attrs = String::new();
            if let Some(requires) = &file.requires_python {
                attrs.push_str(&format!(
                    " data-requires-python=\"{}\"",
                    escape(requires)
                ));
            }
            if file.yanked {
                let reason = file.yanked_reason.as_deref().unwrap_or("");
                attrs.push_str(&format!(" data-yanked=\"{}\"", escape(reason)));
            }
            page.push_str(&format!(
                "    <a href=\"{}\"{}>{}</a><br/>\n",
                self.file_href(file),
                attrs,
                escape(&file.filename)
            ));
        }

        page.push_str("  </body>\n</html>\n");
        page.push_str(&format!("<!--SERIAL {serial}-->"));
        page
    }

    /// Per-project PEP 691 document.
    pub fn render_json(&self, metadata: &ProjectMetadata, serial: u64) -> String {
        let files: Vec<_> = self
            .sorted_files(metadata)
            .into_iter()
            .map(|file| {
                let hashes = match self.page_digest(file) {
                    Some((algo, hash)) => json!({ algo: hash }),
                    None => json!({}),
                };
                json!({
                    "filename": file.filename,
                    "hashes": hashes,
                    "requires-python": file.requires_python.clone().unwrap_or_default(),
                    "size": file.size,
                    "upload-time": file.upload_time_iso_8601.clone().unwrap_or_default(),
                    "url": self.file_href(file),
                    "yanked": if file.yanked {
                        file.yanked_reason
                            .clone()
                            .map(serde_json::Value::from)
                            .unwrap_or(serde_json::Value::Bool(true))
                    } else {
                        serde_json::Value::Bool(false)
                    },
                })
            })
            .collect();

        let mut versions: Vec<&String> = metadata.releases.keys().collect();
        versions.sort_by(|a, b| {
            match (Version::parse(a), Version::parse(b)) {
                (Some(va), Some(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => a.cmp(b),
            }
        });

        let doc = json!({
            "meta": {
                "api-version": "1.0",
                "_last-serial": serial,
            },
            "name": metadata.info.name,
            "versions": versions,
            "files": files,
        });
        doc.to_string()
    }

    /// Global index page listing every known normalized project directory.
    pub fn render_index_html(&self, names: &[String]) -> String {
        let mut page = String::new();
        page.push_str("<!DOCTYPE html>\n<html>\n  <head>\n");
        page.push_str("    <meta name=\"pypi:repository-version\" content=\"1.0\">\n");
        page.push_str("    <title>Simple Index</title>\n  </head>\n  <body>\n");
        for name in names {
            // Sharded trees need the bucket directory in the href.
            let href = if self.layout.hash_index() {
                let bucket = name.chars().next().unwrap_or('_');
                format!("{bucket}/{name}/")
            } else {
                format!("{name}/")
            };
            page.push_str(&format!(
                "    <a href=\"{}\">{}</a><br/>\n",
                escape(&href),
                escape(name)
            ));
        }
        page.push_str("  </body>\n</html>");
        page
    }

    pub fn render_index_json(&self, names: &[String], serial: u64) -> String {
        let projects: Vec<_> = names.iter().map(|n| json!({ "name": n })).collect();
        json!({
            "meta": {
                "api-version": "1.1",
                "_last-serial": serial,
            },
            "projects": projects,
        })
        .to_string()
    }

    // Files across all surviving releases, ordered by filename so reruns
    // produce identical bytes.
    fn sorted_files<'a>(&self, metadata: &'a ProjectMetadata) -> Vec<&'a ReleaseFile> {
        let mut files = metadata.all_files();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        files
    }

    // Download URL with digest fragment. Relative into the mirror tree by
    // default; absolute when a root URI is configured.
    fn file_href(&self, file: &ReleaseFile) -> String {
        let blob = self.layout.blob_path(file);
        let base = if self.root_uri.is_empty() {
            self.layout.relative_blob_href(&blob)
        } else {
            let tail = blob
                .strip_prefix(self.layout.web_dir())
                .unwrap_or(&blob)
                .to_string_lossy()
                .replace('\\', "/");
            format!("{}/{}", self.root_uri.trim_end_matches('/'), tail)
        };
        match self.page_digest(file) {
            Some((algo, hash)) => format!("{base}#{algo}={hash}"),
            None => base,
        }
    }

    // The digest advertised on pages: the configured algorithm when the
    // upstream declared it, else whatever digest is available.
    fn page_digest<'a>(&self, file: &'a ReleaseFile) -> Option<(&'a str, &'a str)> {
        match file.digest_for(self.digest.as_str()) {
            Some(hash) => Some((self.digest.as_str(), hash)),
            None => file.digest(),
        }
    }
}

/// Minimal HTML escaping for text and attribute positions.
fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ProjectInfo;
    use std::collections::BTreeMap;

    fn renderer() -> SimpleRenderer {
        SimpleRenderer::new(Layout::new("/m", false), HashAlgo::Sha256, "")
    }

    fn sample_metadata() -> ProjectMetadata {
        let file = ReleaseFile {
            filename: "foo-1.0.tar.gz".to_string(),
            url: "https://files.example.org/packages/aa/bb/foo-1.0.tar.gz".to_string(),
            size: 1024,
            digests: BTreeMap::from([("sha256".to_string(), "cafe01".to_string())]),
            requires_python: Some(">=3.8".to_string()),
            yanked: false,
            yanked_reason: None,
            packagetype: "sdist".to_string(),
            upload_time_iso_8601: Some("2024-03-01T10:00:00.000000Z".to_string()),
        };
        ProjectMetadata {
            info: ProjectInfo {
                name: "foo".to_string(),
                version: Some("1.0".to_string()),
            },
            last_serial: 42,
            releases: BTreeMap::from([("1.0".to_string(), vec![file])]),
        }
    }

    #[test]
    fn test_html_page_anchor_and_serial_comment() {
        let page = renderer().render_html(&sample_metadata(), 42);

        assert!(page.contains("<title>Links for foo</title>"));
        assert!(page.contains(
            "href=\"../../packages/aa/bb/foo-1.0.tar.gz#sha256=cafe01\""
        ));
        assert!(page.contains("data-requires-python=\"&gt;=3.8\""));
        assert!(page.ends_with("<!--SERIAL 42-->"));
    }

    #[test]
    fn test_html_yanked_attribute() {
        let mut meta = sample_metadata();
        {
            let file = &mut meta.releases.get_mut("1.0").unwrap()[0];
            file.yanked = true;
            file.yanked_reason = Some("broken build".to_string());
        }
        let page = renderer().render_html(&meta, 42);
        assert!(page.contains("data-yanked=\"broken build\""));
    }

    #[test]
    fn test_root_uri_makes_absolute_hrefs() {
        let renderer = SimpleRenderer::new(
            Layout::new("/m", false),
            HashAlgo::Sha256,
            "https://mirror.example.org",
        );
        let page = renderer.render_html(&sample_metadata(), 42);
        assert!(page.contains(
            "href=\"https://mirror.example.org/packages/aa/bb/foo-1.0.tar.gz#sha256=cafe01\""
        ));
    }

    #[test]
    fn test_json_page_shape() {
        let doc: serde_json::Value =
            serde_json::from_str(&renderer().render_json(&sample_metadata(), 42)).unwrap();

        assert_eq!(doc["meta"]["api-version"], "1.0");
        assert_eq!(doc["meta"]["_last-serial"], 42);
        assert_eq!(doc["name"], "foo");
        assert_eq!(doc["versions"][0], "1.0");
        let file = &doc["files"][0];
        assert_eq!(file["filename"], "foo-1.0.tar.gz");
        assert_eq!(file["hashes"]["sha256"], "cafe01");
        assert_eq!(file["size"], 1024);
        assert_eq!(file["requires-python"], ">=3.8");
        assert_eq!(file["yanked"], false);
    }

    #[test]
    fn test_json_versions_sorted_by_parsed_version() {
        let mut meta = sample_metadata();
        let file = meta.releases["1.0"][0].clone();
        meta.releases.insert("1.10".to_string(), vec![file.clone()]);
        meta.releases.insert("1.2".to_string(), vec![file]);

        let doc: serde_json::Value =
            serde_json::from_str(&renderer().render_json(&meta, 42)).unwrap();
        let versions: Vec<&str> = doc["versions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(versions, vec!["1.0", "1.2", "1.10"]);
    }

    #[test]
    fn test_yanked_reason_in_json() {
        let mut meta = sample_metadata();
        {
            let file = &mut meta.releases.get_mut("1.0").unwrap()[0];
            file.yanked = true;
            file.yanked_reason = Some("cve".to_string());
        }
        let doc: serde_json::Value =
            serde_json::from_str(&renderer().render_json(&meta, 42)).unwrap();
        assert_eq!(doc["files"][0]["yanked"], "cve");
    }

    #[test]
    fn test_global_index_both_formats() {
        let names = vec!["bar".to_string(), "foo".to_string()];
        let html = renderer().render_index_html(&names);
        assert!(html.contains("<a href=\"bar/\">bar</a>"));
        assert!(html.contains("<a href=\"foo/\">foo</a>"));

        let doc: serde_json::Value =
            serde_json::from_str(&renderer().render_index_json(&names, 7)).unwrap();
        assert_eq!(doc["meta"]["api-version"], "1.1");
        assert_eq!(doc["meta"]["_last-serial"], 7);
        assert_eq!(doc["projects"][0]["name"], "bar");
        assert_eq!(doc["projects"][1]["name"], "foo");
    }

    #[test]
    fn test_global_index_sharded_hrefs_include_bucket() {
        let renderer = SimpleRenderer::new(Layout::new("/m", true), HashAlgo::Sha256, "");
        let html = renderer.render_index_html(&["foo".to_string()]);
        assert!(html.contains("<a href=\"f/foo/\">foo</a>"));
    }

    #[test]
    fn test_identical_input_renders_identical_bytes() {
        let meta = sample_metadata();
        let renderer = renderer();
        assert_eq!(
            renderer.render_html(&meta, 42),
            renderer.render_html(&meta, 42)
        );
        assert_eq!(
            renderer.render_json(&meta, 42),
            renderer.render_json(&meta, 42)
        );
    }
}
