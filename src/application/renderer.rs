//! Drives one leased surface through the frames of a chunk.

use crate::domain::chunks::{frame_timestamp, Chunk};
use crate::domain::frame::Frame;
use crate::domain::jobs::Resolution;
use crate::error::RenderError;
use crate::ports::surface::{RenderSurface, SurfaceError};
use futures::stream::{self, Stream};
use std::ops::Range;
use tracing::{debug, warn};

pub struct FrameRenderer {
    /// Extra attempts per frame after a transient failure.
    capture_retries: u32,
}

struct RenderState<'a> {
    surface: &'a mut dyn RenderSurface,
    overlay_spec: &'a serde_json::Value,
    resolution: Resolution,
    chunk: Chunk,
    fps: f64,
    frames: Range<u64>,
    loaded: bool,
}

impl FrameRenderer {
    pub fn new(capture_retries: u32) -> Self {
        Self { capture_retries }
    }

    /// Lazily render every frame of `chunk`.
    ///
    /// The overlay is loaded once, before the first frame. Each frame is a
    /// seek that has completed followed by a capture, so frames come out in
    /// strictly increasing order. The first error ends the stream.
    pub fn render<'a>(
        &'a self,
        surface: &'a mut dyn RenderSurface,
        overlay_spec: &'a serde_json::Value,
        chunk: Chunk,
        resolution: Resolution,
        fps: f64,
    ) -> impl Stream<Item = Result<Frame, RenderError>> + Send + 'a {
        let state = RenderState {
            surface,
            overlay_spec,
            resolution,
            frames: chunk.frame_range(fps),
            chunk,
            fps,
            loaded: false,
        };

        stream::try_unfold(state, move |mut state| async move {
            if !state.loaded {
                state
                    .surface
                    .load_overlay(state.overlay_spec, state.resolution)
                    .await
                    .map_err(|e| RenderError::OverlayLoad {
                        chunk_index: state.chunk.index,
                        message: e.to_string(),
                    })?;
                state.loaded = true;
                debug!(
                    chunk = state.chunk.index,
                    "Overlay loaded, rendering frames {:?}", state.frames
                );
            }

            let Some(global_index) = state.frames.next() else {
                return Ok(None);
            };
            let index = global_index - state.chunk.frame_range(state.fps).start;
            let timestamp = frame_timestamp(global_index, state.fps);
            let data = self
                .capture(&mut *state.surface, state.chunk.index, index, timestamp)
                .await?;

            let frame = Frame {
                index,
                global_index,
                timestamp,
                data,
            };
            Ok(Some((frame, state)))
        })
    }

    async fn capture(
        &self,
        surface: &mut dyn RenderSurface,
        chunk_index: usize,
        frame_index: u64,
        timestamp: f64,
    ) -> Result<bytes::Bytes, RenderError> {
        let attempts = self.capture_retries + 1;
        let mut last: Option<SurfaceError> = None;
        for attempt in 1..=attempts {
            let result = match surface.seek_to(timestamp).await {
                Ok(()) => surface.capture().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_crash() => {
                    last = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        chunk = chunk_index,
                        "Frame {} at {:.3}s failed (attempt {}/{}): {}",
                        frame_index,
                        timestamp,
                        attempt,
                        attempts,
                        e
                    );
                    last = Some(e);
                }
            }
        }
        Err(RenderError::FrameCapture {
            chunk_index,
            frame_index,
            message: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pool::testing::FakeFactory;
    use crate::ports::surface::SurfaceFactory;
    use futures::{pin_mut, TryStreamExt};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn chunk(index: usize, start: f64, end: f64) -> Chunk {
        Chunk {
            index,
            start_time: start,
            end_time: end,
        }
    }

    #[tokio::test]
    async fn test_renders_every_frame_in_order() {
        let (factory, state) = FakeFactory::new();
        let mut surface = factory.create().await.unwrap();
        let renderer = FrameRenderer::new(2);
        let spec = json!({"cues": []});

        let frames: Vec<Frame> = renderer
            .render(
                surface.as_mut(),
                &spec,
                chunk(1, 10.0, 20.0),
                Resolution::new(640, 360),
                30.0,
            )
            .try_collect()
            .await
            .unwrap();

        assert_eq!(frames.len(), 300);
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[0].global_index, 300);
        assert!((frames[0].timestamp - 10.0).abs() < 1e-9);
        assert_eq!(frames[299].global_index, 599);
        assert!(frames.windows(2).all(|w| w[1].index == w[0].index + 1));
        assert_eq!(state.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_capture_failure_is_retried() {
        let (factory, state) = FakeFactory::new();
        state.flaky_captures.lock().insert(100);
        let mut surface = factory.create().await.unwrap();
        let renderer = FrameRenderer::new(2);
        let spec = json!({});

        let frames: Vec<Frame> = renderer
            .render(surface.as_mut(), &spec, chunk(0, 0.0, 0.3), Resolution::new(64, 64), 10.0)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(frames.len(), 3);
        // frame at 0.1s was seeked twice
        let seeks = state.seeks.lock().clone();
        assert_eq!(seeks.iter().filter(|t| (**t - 0.1).abs() < 1e-9).count(), 2);
    }

    #[tokio::test]
    async fn test_crash_fails_chunk_with_frame_index() {
        let (factory, state) = FakeFactory::new();
        state.broken_captures.lock().insert(200);
        let mut surface = factory.create().await.unwrap();
        let renderer = FrameRenderer::new(2);
        let spec = json!({});

        let stream = renderer.render(
            surface.as_mut(),
            &spec,
            chunk(4, 0.0, 1.0),
            Resolution::new(64, 64),
            10.0,
        );
        pin_mut!(stream);
        let mut produced = 0;
        let err = loop {
            match stream.try_next().await {
                Ok(Some(_)) => produced += 1,
                Ok(None) => panic!("stream should fail"),
                Err(e) => break e,
            }
        };
        assert_eq!(produced, 2);
        match err {
            RenderError::FrameCapture {
                chunk_index,
                frame_index,
                ..
            } => {
                assert_eq!(chunk_index, 4);
                assert_eq!(frame_index, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
