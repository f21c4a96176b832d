use std::fmt;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::job::Job;
use crate::layout::Layout;
use crate::ownership::OwnershipError;
use crate::pipeline::TranscodePipeline;

/// Why a leftover source file was not resubmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The serve video has no readable owner marker
    NoVideoOwner,
    /// The serve thumbnail has no readable owner marker
    NoThumbnailOwner,
    /// Video and thumbnail were reserved by different principals
    OwnerMismatch { video: String, thumbnail: String },
    /// The fast queue had no room; the files stay for the next scan
    QueueFull,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoVideoOwner => f.write_str("video has no owner"),
            SkipReason::NoThumbnailOwner => f.write_str("thumbnail has no owner"),
            SkipReason::OwnerMismatch { video, thumbnail } => {
                write!(f, "video owned by {} but thumbnail owned by {}", video, thumbnail)
            }
            SkipReason::QueueFull => f.write_str("process queue full"),
        }
    }
}

/// Result of examining one leftover source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Admitted(String),
    Skipped(String, SkipReason),
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub outcomes: Vec<RecoveryOutcome>,
}

impl RecoveryReport {
    /// Tokens handed back to the fast tier
    pub fn admitted(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                RecoveryOutcome::Admitted(token) => Some(token.as_str()),
                RecoveryOutcome::Skipped(..) => None,
            })
            .collect()
    }

    pub fn skipped(&self) -> Vec<(&str, &SkipReason)> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                RecoveryOutcome::Skipped(token, reason) => Some((token.as_str(), reason)),
                RecoveryOutcome::Admitted(_) => None,
            })
            .collect()
    }
}

/// List the tokens of every committed source file in the temp directory
///
/// Partial downloads are ignored: an upload that never reached the source
/// name was never accepted.
pub fn find_pending_tokens(layout: &Layout) -> Result<Vec<String>> {
    let mut tokens = Vec::new();

    for entry in WalkDir::new(&layout.temp_dir).min_depth(1).max_depth(1) {
        let entry = entry
            .with_context(|| format!("Failed to read temp directory: {}", layout.temp_dir.display()))?;

        if !entry.file_type().is_file() {
            continue;
        }

        match layout.token_from_source(entry.path()) {
            Some(token) => tokens.push(token),
            None => debug!("Ignoring {}", entry.path().display()),
        }
    }

    tokens.sort();
    Ok(tokens)
}

/// Resubmit every source file left behind by a previous run
///
/// The owner comes from the serve paths' markers. Nothing is deleted here:
/// a skipped source stays put and is looked at again on the next start.
/// Running this twice without processing in between admits the same tokens
/// both times.
pub fn recover_pending(pipeline: &TranscodePipeline) -> Result<RecoveryReport> {
    let layout = pipeline.layout();
    let tokens = find_pending_tokens(layout)?;
    info!("Found {} unprocessed upload(s) in {}", tokens.len(), layout.temp_dir.display());

    let mut report = RecoveryReport::default();

    for token in tokens {
        let source = layout.source_path(&token);

        let outcome = match recovered_owner(pipeline, &token) {
            Err(reason) => RecoveryOutcome::Skipped(token, reason),
            Ok(owner) => {
                let job = Job::new(token.clone(), owner, layout);
                if pipeline.resubmit(job) {
                    RecoveryOutcome::Admitted(token)
                } else {
                    RecoveryOutcome::Skipped(token, SkipReason::QueueFull)
                }
            }
        };

        match &outcome {
            RecoveryOutcome::Admitted(_) => info!("{}: Added to process queue", source.display()),
            RecoveryOutcome::Skipped(_, reason) => warn!("{}: Not processing: {}", source.display(), reason),
        }
        report.outcomes.push(outcome);
    }

    Ok(report)
}

fn recovered_owner(pipeline: &TranscodePipeline, token: &str) -> Result<String, SkipReason> {
    let layout = pipeline.layout();
    let store = pipeline.store();

    let video = store
        .read_owner(&layout.serve_video_path(token))
        .map_err(|e| log_missing_owner(e, SkipReason::NoVideoOwner))?;
    let thumbnail = store
        .read_owner(&layout.serve_thumbnail_path(token))
        .map_err(|e| log_missing_owner(e, SkipReason::NoThumbnailOwner))?;

    if video != thumbnail {
        return Err(SkipReason::OwnerMismatch { video, thumbnail });
    }
    Ok(video)
}

fn log_missing_owner(err: OwnershipError, reason: SkipReason) -> SkipReason {
    debug!("{}", err);
    reason
}
