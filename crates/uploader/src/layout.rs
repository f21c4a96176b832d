//! File and URL naming for uploads.
//!
//! Every path and URL of an upload is derived from its token:
//!
//! | file | location |
//! |---|---|
//! | in-flight download | `temp/<token>.dl.<ext>` |
//! | committed source (recovery signal) | `temp/<token>.src.<ext>` |
//! | transcode output | `temp/<token>.dst.<ext>` |
//! | thumbnail output | `temp/<token>.jpg` |
//! | published video | `serve/<token>.<ext>` |
//! | published thumbnail | `serve/<token>.jpg` |

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::ServiceConfig;

/// Prefix of every generated token
pub const TOKEN_PREFIX: &str = "video-";

const THUMBNAIL_EXTENSION: &str = "jpg";

/// Generate a fresh, URL-safe upload token
pub fn generate_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4().simple())
}

/// Directory and URL scheme that job paths are derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub temp_dir: PathBuf,
    pub serve_dir: PathBuf,
    pub video_extension: String,
    pub storage_url: String,
    pub api_url: String,
}

impl Layout {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            temp_dir: cfg.temp_dir.clone(),
            serve_dir: cfg.serve_dir.clone(),
            video_extension: cfg.video_extension.clone(),
            storage_url: cfg.storage_url(),
            api_url: cfg.api_url(),
        }
    }

    pub fn download_path(&self, token: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.dl.{}", token, self.video_extension))
    }

    pub fn source_path(&self, token: &str) -> PathBuf {
        self.temp_dir.join(format!("{}{}", token, self.source_suffix()))
    }

    pub fn transcode_path(&self, token: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.dst.{}", token, self.video_extension))
    }

    pub fn thumbnail_path(&self, token: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.{}", token, THUMBNAIL_EXTENSION))
    }

    pub fn serve_video_path(&self, token: &str) -> PathBuf {
        self.serve_dir.join(format!("{}.{}", token, self.video_extension))
    }

    pub fn serve_thumbnail_path(&self, token: &str) -> PathBuf {
        self.serve_dir.join(format!("{}.{}", token, THUMBNAIL_EXTENSION))
    }

    pub fn video_url(&self, token: &str) -> String {
        format!("{}/{}.{}", self.storage_url, token, self.video_extension)
    }

    pub fn thumbnail_url(&self, token: &str) -> String {
        format!("{}/{}.{}", self.storage_url, token, THUMBNAIL_EXTENSION)
    }

    pub fn delete_url(&self, token: &str) -> String {
        format!("{}/uploads/{}", self.api_url, token)
    }

    /// File name suffix that marks a committed source file
    pub fn source_suffix(&self) -> String {
        format!(".src.{}", self.video_extension)
    }

    /// Recover the token from a source file's path
    ///
    /// Returns `None` for anything that is not a source file of this layout.
    pub fn token_from_source(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let token = name.strip_suffix(&self.source_suffix())?;
        if token.is_empty() {
            return None;
        }
        Some(token.to_string())
    }
}

/// Check that a token from a request is safe to use in a file name
pub fn is_valid_token(token: &str) -> bool {
    token
        .strip_prefix(TOKEN_PREFIX)
        .map(|rest| {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
        .unwrap_or(false)
}
