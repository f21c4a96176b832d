use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::pool::DEFAULT_QUEUE_CAPACITY;

/// Userinfo path on a box API when `AUTH_URL_PATH` is not set
const DEFAULT_AUTH_URL_PATH: &str = "o/oauth2/userinfo";

/// Configuration for the upload and transcoding service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory for downloads, sources and transcode outputs
    pub temp_dir: PathBuf,
    /// Directory that published files are renamed into; must be on the same
    /// filesystem as `temp_dir`
    pub serve_dir: PathBuf,
    /// Base URL of this deployment
    pub public_url: String,
    /// Path appended to `public_url` under which `serve_dir` is exposed
    pub storage_url_path: String,
    /// Path appended to `public_url` under which the API is exposed
    pub api_url_path: String,
    /// OIDC userinfo endpoint used to authenticate requests
    pub auth_url: String,
    /// Address the HTTP server binds to
    pub listen_addr: String,
    /// Number of workers doing fast, low quality work
    pub fast_workers: usize,
    /// Number of workers doing slow, high quality work
    pub slow_workers: usize,
    /// Capacity of each worker pool's queue
    pub queue_capacity: usize,
    /// Container extension of uploaded and published videos
    pub video_extension: String,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Path to the exiftool binary
    pub exiftool_bin: PathBuf,
    /// Kill external tools that run longer than this (unbounded if unset)
    pub tool_timeout_secs: Option<u64>,
    /// Maximum accepted size of a multipart upload in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ServiceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/uploader/temp"),
            serve_dir: PathBuf::from("/tmp/uploader/serve"),
            public_url: "http://localhost:8080".to_string(),
            storage_url_path: "/storage".to_string(),
            api_url_path: "/".to_string(),
            auth_url: String::new(),
            listen_addr: "0.0.0.0:8080".to_string(),
            fast_workers: 4,
            slow_workers: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            video_extension: "mp4".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            exiftool_bin: PathBuf::from("exiftool"),
            tool_timeout_secs: None,
            max_upload_bytes: 4 * 1024 * 1024 * 1024, // 4GB
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Override fields from `UPLOADER_*` environment variables
    ///
    /// On a box deployment `LAYERS_API_URI` stands in for an unset public URL,
    /// and the auth URL is derived from it plus `AUTH_URL_PATH`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("UPLOADER_TEMP_PATH") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = var("UPLOADER_SERVE_PATH") {
            self.serve_dir = PathBuf::from(v);
        }
        let box_uri = var("LAYERS_API_URI").map(|v| v.trim_end_matches('/').to_string());

        if let Some(v) = var("UPLOADER_PUBLIC_URL").or_else(|| box_uri.clone()) {
            self.public_url = v;
        }
        if let Some(v) = var("UPLOADER_STORAGE_URL_PATH") {
            self.storage_url_path = v;
        }
        if let Some(v) = var("UPLOADER_API_URL_PATH") {
            self.api_url_path = v;
        }
        if let Some(v) = var("UPLOADER_AUTH_URL") {
            self.auth_url = v;
        } else if let Some(base) = box_uri.as_ref().filter(|_| self.auth_url.is_empty()) {
            let path = var("AUTH_URL_PATH")
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_AUTH_URL_PATH.to_string());
            self.auth_url = format!("{}/{}", base, path);
        }
        if let Some(v) = var("UPLOADER_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = var("UPLOADER_FAST_WORKERS") {
            self.fast_workers = v
                .parse()
                .with_context(|| format!("Expected a number for UPLOADER_FAST_WORKERS, got {:?}", v))?;
        }
        if let Some(v) = var("UPLOADER_SLOW_WORKERS") {
            self.slow_workers = v
                .parse()
                .with_context(|| format!("Expected a number for UPLOADER_SLOW_WORKERS, got {:?}", v))?;
        }

        Ok(())
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.temp_dir.as_os_str().is_empty() {
            bail!("No temp directory configured, set temp_dir or UPLOADER_TEMP_PATH");
        }
        if self.serve_dir.as_os_str().is_empty() {
            bail!("No serve directory configured, set serve_dir or UPLOADER_SERVE_PATH");
        }
        if self.auth_url.trim().is_empty() {
            bail!("No auth URL configured, set auth_url, UPLOADER_AUTH_URL or LAYERS_API_URI");
        }
        if self.fast_workers == 0 || self.slow_workers == 0 {
            bail!(
                "Worker counts must be at least 1 (fast: {}, slow: {})",
                self.fast_workers,
                self.slow_workers
            );
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.video_extension.is_empty() || self.video_extension.contains('.') {
            bail!("video_extension must be a bare extension such as \"mp4\"");
        }
        Ok(())
    }

    /// Base URL that published files are reachable under
    pub fn storage_url(&self) -> String {
        join_url(&self.public_url, &self.storage_url_path)
    }

    /// Base URL of the API
    pub fn api_url(&self) -> String {
        join_url(&self.public_url, &self.api_url_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}
