//! Two-tier transcoding pipeline.
//!
//! A job moves `Reserved -> FastProcessing -> SlowQueued -> SlowProcessing
//! -> Done`, or from `Reserved` to `Abandoned` when the fast tier has no
//! room for it. The fast tier extracts rotation, publishes a thumbnail and
//! a low quality rendition; the slow tier publishes the final rendition
//! over it and removes the source file.
//!
//! Steps inside a tier are best effort: a failing step is logged and the
//! next step still runs. Ownership checks are not: a publish that fails its
//! owner check never renames anything.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use thiserror::Error;

use crate::job::{Job, JobStatus};
use crate::layout::{generate_token, Layout};
use crate::ownership::{OwnershipError, OwnershipStore};
use crate::pool::{WorkItem, WorkerPool};
use crate::transcode::{MediaTool, Quality, ToolError, TranscodeOptions};

/// How many fresh tokens an upload tries before giving up on reservation
pub const RESERVATION_ATTEMPTS: usize = 10;

/// Relative position in the video the thumbnail is taken from
pub const THUMBNAIL_POSITION: f64 = 0.3;

/// Errors surfaced by [`TranscodePipeline`]
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not reserve a unique upload name after {0} attempts")]
    ReservationExhausted(usize),

    #[error("process queue full")]
    QueueFull,

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error is an ownership mismatch
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Ownership(e) if e.is_permission_denied())
    }
}

/// One best-effort step of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ExtractRotation,
    GenerateThumbnail,
    Transcode(Quality),
    RemoveSource,
}

impl Step {
    fn label(&self) -> &'static str {
        match self {
            Step::ExtractRotation => "Extract rotation",
            Step::GenerateThumbnail => "Generate thumbnail",
            Step::Transcode(Quality::Low) => "Transcode low-quality",
            Step::Transcode(Quality::High) => "Transcode high-quality",
            Step::RemoveSource => "Delete source file",
        }
    }
}

const FAST_STEPS: [Step; 3] = [
    Step::ExtractRotation,
    Step::GenerateThumbnail,
    Step::Transcode(Quality::Low),
];

const SLOW_STEPS: [Step; 2] = [Step::Transcode(Quality::High), Step::RemoveSource];

struct Inner {
    layout: Layout,
    store: Arc<OwnershipStore>,
    tool: Arc<dyn MediaTool>,
    fast: WorkerPool,
    slow: WorkerPool,
}

/// Binds jobs to the fast and slow worker pools
///
/// Cheap to clone; clones share the same pools and store.
#[derive(Clone)]
pub struct TranscodePipeline {
    inner: Arc<Inner>,
}

impl TranscodePipeline {
    pub fn new(
        layout: Layout,
        store: Arc<OwnershipStore>,
        tool: Arc<dyn MediaTool>,
        fast: WorkerPool,
        slow: WorkerPool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                layout,
                store,
                tool,
                fast,
                slow,
            }),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn store(&self) -> &OwnershipStore {
        &self.inner.store
    }

    pub fn fast_pool(&self) -> &WorkerPool {
        &self.inner.fast
    }

    pub fn slow_pool(&self) -> &WorkerPool {
        &self.inner.slow
    }

    /// Reserve both serve paths of a fresh token for `owner`
    ///
    /// A token whose markers cannot be created is dropped and another one
    /// tried, up to [`RESERVATION_ATTEMPTS`] times.
    pub fn reserve(&self, owner: &str) -> Result<Job, PipelineError> {
        let layout = &self.inner.layout;
        let store = &self.inner.store;

        for attempt in 1..=RESERVATION_ATTEMPTS {
            let token = generate_token();
            let video_path = layout.serve_video_path(&token);
            let thumbnail_path = layout.serve_thumbnail_path(&token);

            if let Err(e) = store.create(&video_path, owner) {
                warn!("Failed to reserve video (attempt {}): {}", attempt, e);
                continue;
            }

            if let Err(e) = store.create(&thumbnail_path, owner) {
                warn!("Failed to reserve thumbnail (attempt {}): {}", attempt, e);
                if let Err(e) = store.delete(&video_path, owner) {
                    warn!("Failed to release video reservation: {}", e);
                }
                continue;
            }

            let job = Job::new(token, owner, layout);
            info!("{}: Created owned files for {}", job.source_path.display(), owner);
            return Ok(job);
        }

        Err(PipelineError::ReservationExhausted(RESERVATION_ATTEMPTS))
    }

    /// Mark the upload complete by renaming the download to the source path
    ///
    /// From here on the source file is what the recovery scan looks for.
    pub fn commit_source(&self, job: &Job) -> Result<(), PipelineError> {
        fs::rename(&job.download_path, &job.source_path)
            .map_err(|e| PipelineError::io(&job.download_path, e))?;
        info!("{}: Downloaded video data", job.source_path.display());
        Ok(())
    }

    /// Hand a committed job to the fast tier without waiting
    ///
    /// When the fast queue is full the job is abandoned: its files and both
    /// reservations are released and [`PipelineError::QueueFull`] returned.
    pub fn admit(&self, mut job: Job) -> Result<(), PipelineError> {
        if self.inner.fast.add_if_space(self.fast_item(job.clone())) {
            info!("{}: Added to process queue", job.source_path.display());
            return Ok(());
        }

        warn!("{}: Process queue full: cancelling processing", job.source_path.display());
        job.status = JobStatus::Abandoned;
        self.release(&job);
        Err(PipelineError::QueueFull)
    }

    /// Resubmit a recovered job to the fast tier, keeping its files if the
    /// queue is full
    pub fn resubmit(&self, job: Job) -> bool {
        self.inner.fast.add_if_space(self.fast_item(job))
    }

    /// Remove every temporary file of `job` and release its reservations
    pub fn release(&self, job: &Job) {
        let source = job.source_path.display().to_string();

        for path in [&job.download_path, &job.source_path] {
            match fs::remove_file(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                result => log_result(&source, &format!("Delete {}", path.display()), &result),
            }
        }

        let result = self.inner.store.delete(&job.serve_path, &job.owner);
        log_result(&source, "Delete serve video file", &result);

        let result = self.inner.store.delete(&job.thumbnail_serve_path, &job.owner);
        log_result(&source, "Delete serve thumbnail file", &result);
    }

    /// Delete a published upload on behalf of `owner`
    ///
    /// Both the video and the thumbnail are attempted. An ownership
    /// mismatch on either is reported in preference to any other error.
    pub fn remove_upload(&self, token: &str, owner: &str) -> Result<(), PipelineError> {
        let layout = &self.inner.layout;
        let video_path = layout.serve_video_path(token);
        let thumbnail_path = layout.serve_thumbnail_path(token);

        let video = self.inner.store.delete(&video_path, owner);
        let thumbnail = self.inner.store.delete(&thumbnail_path, owner);

        log_result(&video_path.display().to_string(), "Delete file", &video);
        log_result(&thumbnail_path.display().to_string(), "Delete file", &thumbnail);

        match (video, thumbnail) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) if e.is_permission_denied() => Err(e.into()),
            (_, Err(e)) if e.is_permission_denied() => Err(e.into()),
            (Err(e), _) | (_, Err(e)) => Err(e.into()),
        }
    }

    /// Stop both tiers, waiting for in-flight work
    pub async fn shutdown(&self) {
        self.inner.fast.shutdown().await;
        self.inner.slow.shutdown().await;
    }

    fn fast_item(&self, job: Job) -> WorkItem {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.process_fast(job).await })
    }

    fn slow_item(&self, job: Job) -> WorkItem {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.process_slow(job).await })
    }

    /// First pass: rotation, thumbnail, low quality rendition
    async fn process_fast(&self, mut job: Job) {
        job.status = JobStatus::FastProcessing;
        self.run_steps(&FAST_STEPS, &mut job).await;

        // Quality completion is never dropped, wait for slow tier space
        job.status = JobStatus::SlowQueued;
        let item = self.slow_item(job);
        self.inner.slow.add_blocking(item).await;
    }

    /// Second pass: high quality rendition, then source cleanup
    async fn process_slow(&self, mut job: Job) {
        job.status = JobStatus::SlowProcessing;
        self.run_steps(&SLOW_STEPS, &mut job).await;

        job.status = JobStatus::Done;
        let elapsed = Utc::now().signed_duration_since(job.created_at);
        info!(
            "{}: {} after {}s",
            job.source_path.display(),
            job.status,
            elapsed.num_seconds()
        );
    }

    async fn run_steps(&self, steps: &[Step], job: &mut Job) {
        for step in steps {
            let result = self.run_step(*step, job).await;
            log_result(&job.source_path.display().to_string(), step.label(), &result);
        }
    }

    async fn run_step(&self, step: Step, job: &mut Job) -> Result<(), PipelineError> {
        match step {
            Step::ExtractRotation => {
                // On failure the job keeps its default of no correction
                job.rotation = self.inner.tool.extract_rotation(&job.source_path).await?;
            }
            Step::GenerateThumbnail => self.generate_thumbnail(job).await?,
            Step::Transcode(quality) => self.transcode(job, quality).await?,
            Step::RemoveSource => {
                fs::remove_file(&job.source_path).map_err(|e| PipelineError::io(&job.source_path, e))?;
            }
        }
        Ok(())
    }

    async fn generate_thumbnail(&self, job: &Job) -> Result<(), PipelineError> {
        let tool = &self.inner.tool;

        let duration = tool.extract_duration(&job.source_path).await?;
        let at_secs = duration * THUMBNAIL_POSITION;
        tool.generate_thumbnail(&job.source_path, &job.thumbnail_path, at_secs, job.rotation)
            .await?;

        self.publish(&job.thumbnail_path, &job.thumbnail_serve_path, &job.owner)
    }

    async fn transcode(&self, job: &Job, quality: Quality) -> Result<(), PipelineError> {
        let options = TranscodeOptions {
            rotation: job.rotation,
            quality,
        };
        self.inner
            .tool
            .transcode(&job.source_path, &job.transcode_path, &options)
            .await?;

        self.publish(&job.transcode_path, &job.serve_path, &job.owner)
    }

    /// Rename a finished temp file onto its serve path, discarding it if
    /// the owner check fails
    fn publish(&self, src: &Path, dest: &Path, owner: &str) -> Result<(), PipelineError> {
        if let Err(e) = self.inner.store.move_into(src, dest, owner) {
            let _ = fs::remove_file(src);
            return Err(e.into());
        }
        Ok(())
    }
}

fn log_result<T, E: std::fmt::Display>(context: &str, action: &str, result: &Result<T, E>) {
    match result {
        Ok(_) => info!("{}: {} succeeded", context, action),
        Err(e) => error!("{}: {} failed: {}", context, action, e),
    }
}
