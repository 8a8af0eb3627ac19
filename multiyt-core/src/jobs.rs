use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::{AudioFormat, VideoResolution};

pub const PROVISIONAL_TITLE: &str = "Waiting for title...";
const FAILURE_REASON_MAX: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadKind {
    Video { resolution: VideoResolution },
    Audio { format: AudioFormat },
}

/// Immutable per-job settings, snapshotted when the job is enqueued. Shared
/// by every job of one submission via `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub output_dir: PathBuf,
    pub filename_template: String,
    pub kind: DownloadKind,
    pub embed_thumbnail: bool,
    pub embed_metadata: bool,
}

impl JobOptions {
    /// Post-processing (audio extraction, embedding) runs through ffmpeg.
    pub fn requires_ffmpeg(&self) -> bool {
        matches!(self.kind, DownloadKind::Audio { .. })
            || self.embed_thumbnail
            || self.embed_metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Downloading,
    Merging,
    ExtractingAudio,
    Embedding,
    FixingContainer,
    WritingMetadata,
    Completed,
    Failed(Option<String>),
    Cancelled,
    Error(String),
}

impl JobStatus {
    /// Builds a `Failed` status with the reason cut to a displayable length.
    pub fn failed(reason: impl Into<String>) -> JobStatus {
        let reason: String = reason.into();
        let truncated: String = reason.chars().take(FAILURE_REASON_MAX).collect();
        JobStatus::Failed(Some(truncated))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed(_)
                | JobStatus::Cancelled
                | JobStatus::Error(_)
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed(_) | JobStatus::Error(_))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "Queued"),
            JobStatus::Downloading => write!(f, "Downloading"),
            JobStatus::Merging => write!(f, "Merging..."),
            JobStatus::ExtractingAudio => write!(f, "Extracting Audio..."),
            JobStatus::Embedding => write!(f, "Embedding..."),
            JobStatus::FixingContainer => write!(f, "Fixing M4a..."),
            JobStatus::WritingMetadata => write!(f, "Writing Metadata..."),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed(None) => write!(f, "Failed"),
            JobStatus::Failed(Some(reason)) => write!(f, "Failed: {reason}"),
            JobStatus::Cancelled => write!(f, "Cancelled"),
            JobStatus::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// One acquisition unit: a single video, or one item of a playlist.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub original_url: String,
    /// 1-based position within the playlist, when the URL expanded to more
    /// than one item.
    pub playlist_index: Option<u32>,
    pub options: Arc<JobOptions>,
    pub title: String,
    pub status: JobStatus,
    pub progress: String,
}

impl Job {
    pub fn new(url: impl Into<String>, playlist_index: Option<u32>, options: Arc<JobOptions>) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_url: url.into(),
            playlist_index,
            options,
            title: PROVISIONAL_TITLE.to_string(),
            status: JobStatus::Queued,
            progress: "0%".to_string(),
        }
    }
}
