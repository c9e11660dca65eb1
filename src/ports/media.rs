use crate::domain::av::compositor::CompositeRequest;
use crate::domain::av::encoder::{EncodeSettings, EncodedSegment};
use crate::domain::av::probe::MediaInfo;
use crate::domain::chunks::Chunk;
use crate::domain::frame::Frame;
use crate::error::RenderError;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Streaming destination for the frames of one chunk.
#[async_trait]
pub trait FrameSink: Send {
    /// Blocks while the consumer is saturated.
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), RenderError>;

    /// Flush, wait for the encoder and hand back the finished segment.
    async fn finish(self: Box<Self>) -> Result<EncodedSegment, RenderError>;

    /// Stop encoding and remove any partial output.
    async fn abort(self: Box<Self>);
}

/// Video tooling used by the orchestrator: probe, chunk encoding, lossless
/// concatenation and final compositing.
#[async_trait]
pub trait MediaPort: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, RenderError>;

    /// File extension of the alpha intermediate produced by `open_encoder`.
    fn segment_extension(&self) -> &'static str;

    async fn open_encoder(
        &self,
        chunk: &Chunk,
        settings: &EncodeSettings,
        output: &Path,
    ) -> Result<Box<dyn FrameSink>, RenderError>;

    /// Concatenate `segments` (already in index order) without re-encoding.
    async fn merge(
        &self,
        segments: &[EncodedSegment],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RenderError>;

    async fn composite(
        &self,
        request: &CompositeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), RenderError>;
}
