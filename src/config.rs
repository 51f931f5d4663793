use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::HashAlgo;

/// Main configuration structure for pymirror
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Mirror behavior settings
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Filter pipeline configuration
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Core mirror settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorConfig {
    /// Replica root directory
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Upstream index URL
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Concurrent sync workers (clamped to 1..=10)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Whole-run timeout in seconds (0 = unlimited)
    #[serde(default)]
    pub global_timeout: u64,

    /// Digest used in page fragments and verification
    #[serde(default = "default_digest")]
    pub digest_name: String,

    /// Simple page representation: "html", "json" or "all"
    #[serde(default = "default_simple_format")]
    pub simple_format: String,

    /// Download-skip comparison: "hash" or "stat"
    #[serde(default = "default_compare_method")]
    pub compare_method: String,

    /// Bucket per-project simple directories by first character
    #[serde(default)]
    pub hash_index: bool,

    /// Archived index page versions to retain per project (0 = disabled)
    #[serde(default)]
    pub keep_index_versions: usize,

    /// Abort the run on the first unrecovered project error
    #[serde(default)]
    pub stop_on_error: bool,

    /// Absolute URI prefix for file links; relative links when empty
    #[serde(default)]
    pub root_uri: String,

    /// Seconds to wait for the replica directory lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
}

/// Storage backend selection
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Registry name of the backend ("filesystem", "memory")
    #[serde(default = "default_backend")]
    pub backend: String,
}

/// Filter pipeline configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FiltersConfig {
    /// Names of enabled filters; unknown names fail startup
    #[serde(default)]
    pub enabled: Vec<String>,

    #[serde(default)]
    pub allowlist: AllowlistConfig,

    #[serde(default)]
    pub denylist: DenylistConfig,

    #[serde(default)]
    pub latest_release: LatestReleaseConfig,

    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub size: SizeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AllowlistConfig {
    /// Bare names admit whole projects; PEP 440 entries admit releases
    #[serde(default)]
    pub packages: Vec<String>,

    /// Only projects matching some pattern are admitted
    #[serde(default)]
    pub project_regex: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DenylistConfig {
    /// Bare names deny whole projects; PEP 440 entries deny releases
    #[serde(default)]
    pub packages: Vec<String>,

    /// Projects matching any pattern are denied
    #[serde(default)]
    pub project_regex: Vec<String>,

    /// Release versions matching any pattern are denied
    #[serde(default)]
    pub release_regex: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LatestReleaseConfig {
    /// Newest versions to retain (0 = keep everything)
    #[serde(default)]
    pub keep: usize,

    /// "version" for parsed-version ordering, "time" for upload time
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PlatformConfig {
    /// Denied platform tags (e.g. "windows", "macos", "linux-armv7l")
    /// and package types (e.g. "bdist_egg")
    #[serde(default)]
    pub denied: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SizeConfig {
    /// Reject projects whose summed release size exceeds this ("5GB",
    /// "500MB", plain bytes). Empty disables the cap.
    #[serde(default)]
    pub max_package_size: String,

    /// Projects exempt from the cap
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_directory() -> String {
    "${HOME}/pymirror".to_string()
}
fn default_upstream_url() -> String {
    "https://pypi.org".to_string()
}
fn default_workers() -> usize {
    3
}
fn default_timeout() -> u64 {
    10
}
fn default_digest() -> String {
    "sha256".to_string()
}
fn default_simple_format() -> String {
    "all".to_string()
}
fn default_compare_method() -> String {
    "hash".to_string()
}
fn default_lock_timeout() -> u64 {
    5
}
fn default_backend() -> String {
    "filesystem".to_string()
}
fn default_sort_by() -> String {
    "version".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            upstream_url: default_upstream_url(),
            workers: default_workers(),
            timeout: default_timeout(),
            global_timeout: 0,
            digest_name: default_digest(),
            simple_format: default_simple_format(),
            compare_method: default_compare_method(),
            hash_index: false,
            keep_index_versions: 0,
            stop_on_error: false,
            root_uri: String::new(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

impl Default for LatestReleaseConfig {
    fn default() -> Self {
        Self {
            keep: 0,
            sort_by: default_sort_by(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("pymirror").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.mirror.directory = shellexpand::full(&self.mirror.directory)
            .context("Failed to expand mirror directory path")?
            .into_owned();

        Ok(())
    }

    /// Reject values the sync engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.hash_algo().is_none() {
            return Err(anyhow!("unknown digest: {}", self.mirror.digest_name));
        }
        if !["html", "json", "all"].contains(&self.mirror.simple_format.as_str()) {
            return Err(anyhow!(
                "unknown simple_format: {}",
                self.mirror.simple_format
            ));
        }
        if !["hash", "stat"].contains(&self.mirror.compare_method.as_str()) {
            return Err(anyhow!(
                "unknown compare_method: {}",
                self.mirror.compare_method
            ));
        }
        if !self.filters.size.max_package_size.is_empty()
            && self.max_package_size_bytes().is_none()
        {
            return Err(anyhow!(
                "unparseable max_package_size: {}",
                self.filters.size.max_package_size
            ));
        }
        Ok(())
    }

    /// Worker count, clamped to the supported pool bounds
    pub fn workers(&self) -> usize {
        self.mirror.workers.clamp(1, 10)
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.mirror.timeout.max(1))
    }

    /// Whole-run timeout, when configured
    pub fn global_timeout(&self) -> Option<Duration> {
        (self.mirror.global_timeout > 0)
            .then(|| Duration::from_secs(self.mirror.global_timeout))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.mirror.lock_timeout)
    }

    /// Configured digest algorithm
    pub fn hash_algo(&self) -> Option<HashAlgo> {
        HashAlgo::parse(&self.mirror.digest_name)
    }

    pub fn mirror_root(&self) -> PathBuf {
        PathBuf::from(&self.mirror.directory)
    }

    /// Size-cap threshold in bytes, when configured
    pub fn max_package_size_bytes(&self) -> Option<u64> {
        parse_size(&self.filters.size.max_package_size)
    }
}

/// Parse a human size string like "100MB", "1GB", "512kb" or plain bytes.
pub fn parse_size(size_str: &str) -> Option<u64> {
    let s = size_str.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    let (value, multiplier) = if let Some(v) = s.strip_suffix("gb") {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("mb") {
        (v, 1024 * 1024)
    } else if let Some(v) = s.strip_suffix("kb") {
        (v, 1024)
    } else {
        (s.as_str(), 1)
    };
    value.trim().parse::<u64>().ok().map(|v| v * multiplier)
}
