//! `MediaPort` backed by the ffmpeg and ffprobe command line tools.

use crate::domain::av::cmd::{self, RunError};
use crate::domain::av::compositor::{self, CompositeRequest, VideoEncoder};
use crate::domain::av::encoder::{ChunkEncoder, EncodeSettings, EncodedSegment, IntermediateCodec};
use crate::domain::av::merger;
use crate::domain::av::probe::{self, MediaInfo};
use crate::domain::chunks::Chunk;
use crate::error::RenderError;
use crate::ports::media::{FrameSink, MediaPort};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub intermediate: IntermediateCodec,
    /// Use `h264_nvenc` for mp4 output when ffmpeg supports it.
    pub prefer_hardware: bool,
    /// How long a process may take to exit after being asked to stop.
    pub stop_grace: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            intermediate: IntermediateCodec::default(),
            prefer_hardware: true,
            stop_grace: Duration::from_secs(5),
        }
    }
}

pub struct FfmpegMedia {
    config: FfmpegConfig,
    hardware_encoder: OnceCell<bool>,
}

impl FfmpegMedia {
    pub fn new(config: FfmpegConfig) -> Self {
        Self {
            config,
            hardware_encoder: OnceCell::new(),
        }
    }

    /// Whether this ffmpeg build lists `h264_nvenc`. Checked once.
    pub async fn hardware_encoder_available(&self) -> bool {
        *self
            .hardware_encoder
            .get_or_init(|| async {
                let mut command = cmd::command(&self.config.ffmpeg_path);
                command.args(["-hide_banner", "-encoders"]);
                match cmd::output(&mut command).await {
                    Ok(stdout) => {
                        let found = String::from_utf8_lossy(&stdout).contains("h264_nvenc");
                        info!("Hardware H.264 encoder available: {}", found);
                        found
                    }
                    Err(e) => {
                        warn!("Could not list ffmpeg encoders: {:?}", e);
                        false
                    }
                }
            })
            .await
    }

    async fn run_composite(
        &self,
        request: &CompositeRequest,
        encoder: VideoEncoder,
        source: &MediaInfo,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), RenderError> {
        let mut command = cmd::command(&self.config.ffmpeg_path);
        command.args(compositor::composite_args(
            request,
            encoder,
            source.audio_codec.as_deref(),
        ));
        info!(
            "Compositing {} over {} with {:?}",
            request.overlay.display(),
            request.source.display(),
            encoder
        );

        let duration = source.duration;
        let result = cmd::run(
            &mut command,
            |line| {
                if let Some(seconds) = compositor::parse_out_time(line) {
                    progress((seconds / duration).clamp(0.0, 1.0));
                }
            },
            cancel,
            self.config.stop_grace,
        )
        .await;

        if result.is_err() {
            remove_quietly(&request.output).await;
        }
        match result {
            Ok(()) => Ok(()),
            Err(RunError::Cancelled) => Err(RenderError::Cancelled),
            Err(RunError::Spawn(e)) => Err(RenderError::EncoderUnavailable(format!(
                "failed to start ffmpeg: {}",
                e
            ))),
            Err(RunError::Failed(failure)) => Err(RenderError::Compositing {
                exit_code: failure.exit_code,
                diagnostic: failure.diagnostic,
            }),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl MediaPort for FfmpegMedia {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, RenderError> {
        probe::probe(&self.config.ffprobe_path, path).await
    }

    fn segment_extension(&self) -> &'static str {
        self.config.intermediate.extension()
    }

    async fn open_encoder(
        &self,
        chunk: &Chunk,
        settings: &EncodeSettings,
        output: &Path,
    ) -> Result<Box<dyn FrameSink>, RenderError> {
        let encoder = ChunkEncoder::spawn(
            &self.config.ffmpeg_path,
            self.config.intermediate,
            chunk,
            settings,
            output,
            self.config.stop_grace,
        )?;
        Ok(Box::new(encoder))
    }

    async fn merge(
        &self,
        segments: &[EncodedSegment],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RenderError> {
        merger::check_order(segments)?;
        let mut infos = Vec::with_capacity(segments.len());
        for segment in segments {
            infos.push((segment.index, self.probe(&segment.path).await?));
        }
        merger::check_compatible(&infos)?;

        let manifest = output.with_extension("concat.txt");
        tokio::fs::write(&manifest, merger::concat_manifest(segments)).await?;
        debug!(
            "Merging {} segments via {}",
            segments.len(),
            manifest.display()
        );

        let mut command = cmd::command(&self.config.ffmpeg_path);
        command.args(merger::concat_args(&manifest, output));
        let result = cmd::run(&mut command, |_| {}, cancel, self.config.stop_grace).await;
        remove_quietly(&manifest).await;

        match result {
            Ok(()) => {
                for segment in segments {
                    remove_quietly(&segment.path).await;
                }
                Ok(())
            }
            Err(e) => {
                remove_quietly(output).await;
                Err(match e {
                    RunError::Cancelled => RenderError::Cancelled,
                    RunError::Spawn(e) => {
                        RenderError::EncoderUnavailable(format!("failed to start ffmpeg: {}", e))
                    }
                    RunError::Failed(failure) => RenderError::Merge {
                        exit_code: failure.exit_code,
                        diagnostic: failure.diagnostic,
                    },
                })
            }
        }
    }

    async fn composite(
        &self,
        request: &CompositeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), RenderError> {
        let source = self.probe(&request.source).await?;
        let overlay = self.probe(&request.overlay).await?;
        compositor::validate_inputs(request, &source, &overlay)?;

        let hardware = self.config.prefer_hardware && self.hardware_encoder_available().await;
        let encoder = VideoEncoder::select(request.format, hardware, self.config.prefer_hardware);

        match self
            .run_composite(request, encoder, &source, progress, cancel)
            .await
        {
            Err(RenderError::Compositing { diagnostic, .. }) if encoder.is_hardware() => {
                warn!(
                    "Hardware encoder failed, retrying with libx264: {}",
                    diagnostic
                );
                self.run_composite(request, VideoEncoder::X264, &source, progress, cancel)
                    .await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_ffmpeg_disables_hardware() {
        let media = FfmpegMedia::new(FfmpegConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg"),
            ..FfmpegConfig::default()
        });
        assert!(!media.hardware_encoder_available().await);
    }

    #[tokio::test]
    async fn test_merge_rejects_unordered_segments() {
        let media = FfmpegMedia::new(FfmpegConfig::default());
        let segments = vec![
            EncodedSegment {
                index: 1,
                path: PathBuf::from("/tmp/b.mov"),
                frame_count: 1,
                duration: 0.1,
            },
            EncodedSegment {
                index: 0,
                path: PathBuf::from("/tmp/a.mov"),
                frame_count: 1,
                duration: 0.1,
            },
        ];
        let err = media
            .merge(&segments, Path::new("/tmp/out.mov"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::IncompatibleSegments(_)));
    }

    #[test]
    fn test_segment_extension_follows_codec() {
        let media = FfmpegMedia::new(FfmpegConfig {
            intermediate: IntermediateCodec::Vp9Alpha,
            ..FfmpegConfig::default()
        });
        assert_eq!(media.segment_extension(), "webm");
    }
}
