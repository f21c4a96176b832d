use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::config::ServiceConfig;
use crate::job::Rotation;
use crate::probe;

/// Errors from running an external media tool
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed (exit code {exit_code}): {stderr}")]
    Failed {
        tool: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {secs} seconds")]
    Timeout { tool: String, secs: u64 },

    #[error("could not parse {tool} output: {message}")]
    Parse { tool: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Quality/performance setting for transcoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// Fastest preset, used to make an upload viewable quickly
    Low,
    /// High fidelity, used for the final rendition
    High,
}

impl Quality {
    /// Encoder arguments for this quality
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Quality::Low => &["-preset", "ultrafast"],
            Quality::High => &["-preset", "slow", "-crf", "18"],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Quality::Low => "low-quality",
            Quality::High => "high-quality",
        }
    }
}

/// Filter arguments that undo a recorded rotation
pub fn rotation_args(rotation: Rotation) -> &'static [&'static str] {
    match rotation {
        Rotation::None => &[],
        Rotation::Cw90 => &["-vf", "transpose=1"],
        Rotation::Cw180 => &["-vf", "vflip,hflip"],
        Rotation::Cw270 => &["-vf", "transpose=2"],
    }
}

/// Options for [`MediaTool::transcode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub rotation: Rotation,
    pub quality: Quality,
}

/// Boundary to the external probing and encoding tools
///
/// Every call runs to completion (or failure) before returning; the caller
/// decides what a failure means for the job.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Rotation recorded in the source's metadata
    async fn extract_rotation(&self, src: &Path) -> Result<Rotation, ToolError>;

    /// Duration of the source in seconds
    async fn extract_duration(&self, src: &Path) -> Result<f64, ToolError>;

    /// Transcode `src` into `dst`, overwriting `dst`
    async fn transcode(
        &self,
        src: &Path,
        dst: &Path,
        options: &TranscodeOptions,
    ) -> Result<(), ToolError>;

    /// Write a single frame at `at_secs` of `src` to `dst`
    async fn generate_thumbnail(
        &self,
        src: &Path,
        dst: &Path,
        at_secs: f64,
        rotation: Rotation,
    ) -> Result<(), ToolError>;
}

/// [`MediaTool`] backed by ffmpeg, ffprobe and exiftool binaries
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub exiftool_bin: PathBuf,
    pub timeout_secs: Option<u64>,
}

impl FfmpegTool {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            exiftool_bin: cfg.exiftool_bin.clone(),
            timeout_secs: cfg.tool_timeout_secs,
        }
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn extract_rotation(&self, src: &Path) -> Result<Rotation, ToolError> {
        let args = probe::rotation_args(src);
        let stdout = run_tool(&self.exiftool_bin, &args, self.timeout_secs).await?;
        probe::parse_rotation(&stdout)
    }

    async fn extract_duration(&self, src: &Path) -> Result<f64, ToolError> {
        let args = probe::duration_args(src);
        let stdout = run_tool(&self.ffprobe_bin, &args, self.timeout_secs).await?;
        probe::parse_duration(&stdout)
    }

    async fn transcode(
        &self,
        src: &Path,
        dst: &Path,
        options: &TranscodeOptions,
    ) -> Result<(), ToolError> {
        run_tool(&self.ffmpeg_bin, &transcode_args(src, dst, options), self.timeout_secs).await?;
        Ok(())
    }

    async fn generate_thumbnail(
        &self,
        src: &Path,
        dst: &Path,
        at_secs: f64,
        rotation: Rotation,
    ) -> Result<(), ToolError> {
        let args = thumbnail_args(src, dst, at_secs, rotation);
        run_tool(&self.ffmpeg_bin, &args, self.timeout_secs).await?;
        Ok(())
    }
}

/// Arguments for transcoding `src` to an h264 `dst`
pub fn transcode_args(src: &Path, dst: &Path, options: &TranscodeOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        // Rotation is corrected explicitly below
        "-noautorotate".into(),
        "-i".into(),
        src.display().to_string(),
        "-y".into(),
        "-c:a".into(),
        "copy".into(),
        "-c:v".into(),
        "h264".into(),
        "-v".into(),
        "warning".into(),
    ];

    args.extend(rotation_args(options.rotation).iter().map(|s| s.to_string()));
    args.extend(options.quality.args().iter().map(|s| s.to_string()));

    args.push(dst.display().to_string());
    args
}

/// Arguments for grabbing one frame of `src` at `at_secs` into `dst`
pub fn thumbnail_args(src: &Path, dst: &Path, at_secs: f64, rotation: Rotation) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-noautorotate".into(),
        "-i".into(),
        src.display().to_string(),
        "-y".into(),
        "-ss".into(),
        format!("{:.4}", at_secs),
        "-frames:v".into(),
        "1".into(),
        "-q:v".into(),
        "2".into(),
        "-v".into(),
        "warning".into(),
    ];

    args.extend(rotation_args(rotation).iter().map(|s| s.to_string()));

    args.push(dst.display().to_string());
    args
}

/// Run `bin` with `args` and return its stdout
///
/// A non-zero exit is a [`ToolError::Failed`] carrying stderr. With a
/// timeout, the process is killed once it expires.
pub(crate) async fn run_tool(
    bin: &Path,
    args: &[String],
    timeout_secs: Option<u64>,
) -> Result<String, ToolError> {
    let tool = bin.display().to_string();
    debug!("Executing {} {}", tool, args.join(" "));

    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout_secs {
        Some(secs) => match timeout(Duration::from_secs(secs), cmd.output()).await {
            Ok(result) => result,
            // Dropping the output future kills the child
            Err(_) => return Err(ToolError::Timeout { tool, secs }),
        },
        None => cmd.output().await,
    }
    .map_err(|source| ToolError::Spawn {
        tool: tool.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool,
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
