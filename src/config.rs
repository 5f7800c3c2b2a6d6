//! Configuration module for zipstage.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, ZipstageError};

/// Name of the base directory created under the user's home.
pub const BASE_DIR_NAME: &str = ".zipline_tmp";

/// Sandbox configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Base directory for all sandboxes. Defaults to `<home>/.zipline_tmp`.
    #[serde(default)]
    pub base_dir: Option<String>,
    /// Share one directory between all tenants (single-tenant escape hatch).
    #[serde(default)]
    pub disable_isolation: bool,
    /// Lock time-to-live in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Sandbox retention window in seconds.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Interval between periodic cleanup sweeps in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_lock_ttl() -> u64 {
    30 * 60 // 30 minutes
}

fn default_retention() -> u64 {
    24 * 60 * 60 // 24 hours
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            disable_isolation: false,
            lock_ttl_secs: default_lock_ttl(),
            retention_secs: default_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl SandboxConfig {
    /// Resolve the base directory, falling back to `<home>/.zipline_tmp`.
    pub fn base_path(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.base_dir {
            return Ok(PathBuf::from(dir));
        }
        home_dir()
            .map(|home| home.join(BASE_DIR_NAME))
            .ok_or_else(|| ZipstageError::Config("cannot determine home directory".to_string()))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Staging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingConfig {
    /// Files strictly below this size are staged in memory.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: u64,
    /// Maximum size for direct reads of sandbox files.
    #[serde(default = "default_max_read")]
    pub max_read_bytes: u64,
}

fn default_memory_threshold() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_read() -> u64 {
    1024 * 1024 // 1MB
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: default_memory_threshold(),
            max_read_bytes: default_max_read(),
        }
    }
}

/// Download configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Total download deadline in milliseconds.
    #[serde(default = "default_download_timeout")]
    pub timeout_ms: u64,
    /// Maximum number of body bytes accepted.
    #[serde(default = "default_download_max_bytes")]
    pub max_bytes: u64,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Permit loopback and private-network hosts.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_download_timeout() -> u64 {
    30_000
}

fn default_download_max_bytes() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_redirects() -> usize {
    5
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_download_timeout(),
            max_bytes: default_download_max_bytes(),
            connect_timeout_secs: default_connect_timeout(),
            max_redirects: default_max_redirects(),
            allow_private_hosts: false,
        }
    }
}

/// Content verification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Allowed file extensions, lowercase, without the leading dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Number of leading bytes read for sniffing.
    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,
}

pub(crate) fn default_allowed_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "webp", "bmp", "ico", "svg", "txt", "md", "csv", "json",
        "xml", "yaml", "yml", "log", "html", "css", "pdf", "zip", "gz", "mp3", "wav", "ogg",
        "flac", "mp4", "webm", "mov", "docx", "xlsx", "pptx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sniff_bytes() -> usize {
    8192
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            sniff_bytes: default_sniff_bytes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/zipstage.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Sandbox configuration.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Staging configuration.
    #[serde(default)]
    pub staging: StagingConfig,
    /// Download configuration.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Content verification configuration.
    #[serde(default)]
    pub verify: VerifyConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ZipstageError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ZipstageError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `ZIPLINE_DISABLE_SANDBOXING`: `true` shares one directory between tenants
    /// - `ZIPLINE_TMP_DIR`: Override the sandbox base directory
    /// - `ALLOWED_EXTENSIONS`: Comma-separated extension allow-list
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("ZIPLINE_DISABLE_SANDBOXING") {
            self.sandbox.disable_isolation = value.trim().eq_ignore_ascii_case("true");
        }

        if let Ok(dir) = std::env::var("ZIPLINE_TMP_DIR") {
            if !dir.is_empty() {
                self.sandbox.base_dir = Some(dir);
            }
        }

        if let Ok(list) = std::env::var("ALLOWED_EXTENSIONS") {
            let extensions = parse_extension_list(&list);
            if !extensions.is_empty() {
                self.verify.allowed_extensions = extensions;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.staging.memory_threshold_bytes == 0 {
            return Err(ZipstageError::Validation(
                "staging.memory_threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if self.download.max_bytes == 0 || self.download.timeout_ms == 0 {
            return Err(ZipstageError::Validation(
                "download.max_bytes and download.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.sandbox.cleanup_interval_secs == 0 {
            return Err(ZipstageError::Validation(
                "sandbox.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        // GC is age-only; a retention window inside the lock TTL could collect a live sandbox.
        if self.sandbox.retention_secs <= self.sandbox.lock_ttl_secs {
            return Err(ZipstageError::Validation(format!(
                "sandbox.retention_secs ({}) must exceed sandbox.lock_ttl_secs ({})",
                self.sandbox.retention_secs, self.sandbox.lock_ttl_secs
            )));
        }
        if self.verify.allowed_extensions.is_empty() {
            return Err(ZipstageError::Validation(
                "verify.allowed_extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a comma-separated extension list, normalizing case and leading dots.
fn parse_extension_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
