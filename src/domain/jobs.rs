use crate::error::{ErrorKind, RenderError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Webm,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
        }
    }
}

/// Lifecycle of a render job.
///
/// Forward-only: `queued → initializing → rendering → merging → compositing →
/// uploading → completed`. `failed` and `cancelled` are reachable from every
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Initializing,
    Rendering,
    Merging,
    Compositing,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Initializing => 1,
            JobStatus::Rendering => 2,
            JobStatus::Merging => 3,
            JobStatus::Compositing => 4,
            JobStatus::Uploading => 5,
            JobStatus::Completed => 6,
            JobStatus::Failed | JobStatus::Cancelled => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed | JobStatus::Cancelled => true,
            JobStatus::Completed => *self == JobStatus::Uploading,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Initializing => "initializing",
            JobStatus::Rendering => "rendering",
            JobStatus::Merging => "merging",
            JobStatus::Compositing => "compositing",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One end-to-end rendering request, as supplied by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub job_id: String,
    pub source_video_ref: String,
    /// Passed verbatim to the render surface.
    pub overlay_spec: serde_json::Value,
    pub resolution: Resolution,
    pub fps: f64,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub chunk_size_seconds: Option<f64>,
}

impl RenderJob {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.job_id.trim().is_empty() {
            return Err(RenderError::InvalidJob("job_id must not be empty".into()));
        }
        // The id names the job's working directory.
        let path_safe = self
            .job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !path_safe || self.job_id.starts_with('.') {
            return Err(RenderError::InvalidJob(format!(
                "job_id '{}' contains unsupported characters",
                self.job_id
            )));
        }
        if self.source_video_ref.trim().is_empty() {
            return Err(RenderError::InvalidJob(
                "source_video_ref must not be empty".into(),
            ));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(RenderError::InvalidJob(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(RenderError::InvalidJob(format!(
                "fps must be positive, got {}",
                self.fps
            )));
        }
        if let Some(chunk) = self.chunk_size_seconds {
            if !chunk.is_finite() || chunk <= 0.0 {
                return Err(RenderError::InvalidChunkSize(chunk));
            }
        }
        Ok(())
    }
}

/// Structured description of a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub step: JobStatus,
    pub chunk_index: Option<usize>,
    pub message: String,
}

impl JobFailure {
    pub fn from_error(step: JobStatus, err: &RenderError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_string(),
            step,
            chunk_index: err.chunk_index(),
            message: err.to_string(),
        }
    }
}

/// Terminal result of `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum JobOutcome {
    Success {
        job_id: String,
        output_locator: String,
    },
    Failure {
        job_id: String,
        failure: JobFailure,
    },
    Cancelled {
        job_id: String,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Success { job_id, .. }
            | JobOutcome::Failure { job_id, .. }
            | JobOutcome::Cancelled { job_id } => job_id,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success { .. } => JobStatus::Completed,
            JobOutcome::Failure { .. } => JobStatus::Failed,
            JobOutcome::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}

/// Lifecycle event delivered to subscribers and the external notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_locator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn progress(job_id: &str, status: JobStatus, progress: u8, message: Option<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            progress,
            message,
            output_locator: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn terminal(outcome: &JobOutcome, progress: u8) -> Self {
        let mut event = Self::progress(outcome.job_id(), outcome.status(), progress, None);
        match outcome {
            JobOutcome::Success { output_locator, .. } => {
                event.message = Some("Rendering completed successfully".into());
                event.output_locator = Some(output_locator.clone());
            }
            JobOutcome::Failure { failure, .. } => {
                event.message = Some(failure.message.clone());
                event.error = Some(failure.clone());
            }
            JobOutcome::Cancelled { .. } => {
                event.message = Some("Job cancelled".into());
            }
        }
        event
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
