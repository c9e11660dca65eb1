//! Error taxonomy for the rendering pipeline.

use crate::domain::jobs::JobStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

/// Coarse classification used to decide retries and to report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad job parameters. Never retried.
    InputError,
    /// Renderer or encoder could not be obtained.
    ResourceError,
    /// Storage or network hiccup, retried with backoff.
    TransientIoError,
    /// An external tool exited unsuccessfully.
    SubprocessError,
    Cancelled,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InputError => "input_error",
            ErrorKind::ResourceError => "resource_error",
            ErrorKind::TransientIoError => "transient_io_error",
            ErrorKind::SubprocessError => "subprocess_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invalid duration: {0}s (must be a positive, finite number of seconds)")]
    InvalidDuration(f64),

    #[error("invalid chunk size: {0}s (must be a positive, finite number of seconds)")]
    InvalidChunkSize(f64),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("resolution mismatch: expected {expected}, got {actual}")]
    ResolutionMismatch { expected: String, actual: String },

    #[error("frame rate mismatch: expected {expected} fps, got {actual} fps")]
    FrameRateMismatch { expected: f64, actual: f64 },

    #[error("source video unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to probe media: {0}")]
    Probe(String),

    #[error("renderer unavailable after {attempts} attempt(s): {message}")]
    RendererUnavailable { attempts: u32, message: String },

    #[error("renderer failed to load overlay for chunk {chunk_index}: {message}")]
    OverlayLoad { chunk_index: usize, message: String },

    #[error("frame capture failed for chunk {chunk_index} at frame {frame_index}: {message}")]
    FrameCapture {
        chunk_index: usize,
        frame_index: u64,
        message: String,
    },

    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("encoding failed for chunk {chunk_index} (exit code {exit_code:?}): {diagnostic}")]
    Encoding {
        chunk_index: usize,
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("segments cannot be stream-copied together: {0}")]
    IncompatibleSegments(String),

    #[error("segment merge failed (exit code {exit_code:?}): {diagnostic}")]
    Merge {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("compositing failed (exit code {exit_code:?}): {diagnostic}")]
    Compositing {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("upload failed after {attempts} attempt(s): {message}")]
    Upload { attempts: u32, message: String },

    #[error("{step} step timed out after {after:?}")]
    Timeout {
        step: JobStatus,
        chunk_index: Option<usize>,
        after: Duration,
    },

    #[error("job refused: concurrent job limit reached")]
    AtCapacity,

    #[error("job refused: {0} is already running")]
    DuplicateJob(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderError::InvalidDuration(_)
            | RenderError::InvalidChunkSize(_)
            | RenderError::InvalidJob(_)
            | RenderError::DuplicateJob(_)
            | RenderError::ResolutionMismatch { .. }
            | RenderError::FrameRateMismatch { .. }
            | RenderError::SourceUnavailable(_)
            | RenderError::Probe(_)
            | RenderError::IncompatibleSegments(_) => ErrorKind::InputError,
            RenderError::RendererUnavailable { .. }
            | RenderError::OverlayLoad { .. }
            | RenderError::FrameCapture { .. }
            | RenderError::EncoderUnavailable(_)
            | RenderError::AtCapacity => ErrorKind::ResourceError,
            RenderError::Storage(_) | RenderError::Upload { .. } | RenderError::Io(_) => {
                ErrorKind::TransientIoError
            }
            RenderError::Encoding { .. }
            | RenderError::Merge { .. }
            | RenderError::Compositing { .. } => ErrorKind::SubprocessError,
            RenderError::Timeout { .. } => ErrorKind::Timeout,
            RenderError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Stable machine-readable code sent to the backend.
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::InvalidDuration(_) => "INVALID_DURATION",
            RenderError::InvalidChunkSize(_) => "INVALID_CHUNK_SIZE",
            RenderError::InvalidJob(_) => "INVALID_RENDER_OPTIONS",
            RenderError::ResolutionMismatch { .. } => "RESOLUTION_MISMATCH",
            RenderError::FrameRateMismatch { .. } => "FRAME_RATE_MISMATCH",
            RenderError::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            RenderError::Probe(_) => "INVALID_VIDEO_FORMAT",
            RenderError::RendererUnavailable { .. } => "RENDERER_UNAVAILABLE",
            RenderError::OverlayLoad { .. } => "SCENARIO_LOAD_ERROR",
            RenderError::FrameCapture { .. } => "FRAME_CAPTURE_ERROR",
            RenderError::EncoderUnavailable(_) => "ENCODER_UNAVAILABLE",
            RenderError::Encoding { .. } => "ENCODING_ERROR",
            RenderError::IncompatibleSegments(_) => "INCOMPATIBLE_SEGMENTS",
            RenderError::Merge { .. } => "MERGE_ERROR",
            RenderError::Compositing { .. } => "COMPOSITING_ERROR",
            RenderError::Storage(_) => "STORAGE_ACCESS_ERROR",
            RenderError::Upload { .. } => "S3_UPLOAD_ERROR",
            RenderError::Timeout { .. } => "RENDERING_TIMEOUT",
            RenderError::AtCapacity => "QUEUE_FULL",
            RenderError::DuplicateJob(_) => "DUPLICATE_JOB",
            RenderError::Cancelled => "JOB_CANCELLED",
            RenderError::Io(_) => "SYSTEM_RESOURCE_ERROR",
        }
    }

    /// Chunk the error originated from, when it is chunk-scoped.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            RenderError::OverlayLoad { chunk_index, .. }
            | RenderError::FrameCapture { chunk_index, .. }
            | RenderError::Encoding { chunk_index, .. } => Some(*chunk_index),
            RenderError::Timeout { chunk_index, .. } => *chunk_index,
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(RenderError::InvalidDuration(0.0).kind(), ErrorKind::InputError);
        assert_eq!(
            RenderError::RendererUnavailable {
                attempts: 3,
                message: "boom".into()
            }
            .kind(),
            ErrorKind::ResourceError
        );
        assert_eq!(
            RenderError::Storage("reset by peer".into()).kind(),
            ErrorKind::TransientIoError
        );
        assert_eq!(
            RenderError::Encoding {
                chunk_index: 1,
                exit_code: Some(1),
                diagnostic: String::new()
            }
            .kind(),
            ErrorKind::SubprocessError
        );
        assert_eq!(RenderError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_chunk_index_is_preserved() {
        let err = RenderError::Encoding {
            chunk_index: 1,
            exit_code: Some(1),
            diagnostic: "Invalid data found".into(),
        };
        assert_eq!(err.chunk_index(), Some(1));
        assert_eq!(err.code(), "ENCODING_ERROR");

        let timeout = RenderError::Timeout {
            step: JobStatus::Rendering,
            chunk_index: Some(4),
            after: Duration::from_secs(1),
        };
        assert_eq!(timeout.chunk_index(), Some(4));
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(RenderError::AtCapacity.chunk_index(), None);
    }

    #[test]
    fn test_display_mentions_step() {
        let timeout = RenderError::Timeout {
            step: JobStatus::Merging,
            chunk_index: None,
            after: Duration::from_secs(2),
        };
        assert_eq!(timeout.to_string(), "merging step timed out after 2s");
    }
}
