use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::Layout;

/// Where a job is in the two-tier pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Owner markers exist and the source file is committed
    Reserved,
    /// Running in the fast tier
    FastProcessing,
    /// Waiting for a slow tier worker
    SlowQueued,
    /// Running in the slow tier
    SlowProcessing,
    /// Final quality published and source removed
    Done,
    /// Rejected at admission, reservation released
    Abandoned,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Reserved => "reserved",
            JobStatus::FastProcessing => "fast-processing",
            JobStatus::SlowQueued => "slow-queued",
            JobStatus::SlowProcessing => "slow-processing",
            JobStatus::Done => "done",
            JobStatus::Abandoned => "abandoned",
        };
        f.write_str(label)
    }
}

/// Rotation correction applied while transcoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Map a rotation in degrees as reported by the metadata probe
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Cw90),
            180 => Some(Rotation::Cw180),
            270 => Some(Rotation::Cw270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

/// One uploaded video on its way through the pipeline
///
/// A job is owned by exactly one stage at a time and handed to the next
/// stage by value.
#[derive(Debug, Clone)]
pub struct Job {
    pub token: String,
    /// Principal that reserved the serve paths
    pub owner: String,

    pub download_path: PathBuf,
    pub source_path: PathBuf,
    pub transcode_path: PathBuf,
    pub serve_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub thumbnail_serve_path: PathBuf,

    pub video_url: String,
    pub thumbnail_url: String,
    pub delete_url: String,

    /// Filled in by the fast pass
    pub rotation: Rotation,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build the job for `token` owned by `owner`
    pub fn new(token: impl Into<String>, owner: impl Into<String>, layout: &Layout) -> Self {
        let token = token.into();
        Self {
            download_path: layout.download_path(&token),
            source_path: layout.source_path(&token),
            transcode_path: layout.transcode_path(&token),
            serve_path: layout.serve_video_path(&token),
            thumbnail_path: layout.thumbnail_path(&token),
            thumbnail_serve_path: layout.serve_thumbnail_path(&token),
            video_url: layout.video_url(&token),
            thumbnail_url: layout.thumbnail_url(&token),
            delete_url: layout.delete_url(&token),
            owner: owner.into(),
            rotation: Rotation::None,
            status: JobStatus::Reserved,
            created_at: Utc::now(),
            token,
        }
    }
}
