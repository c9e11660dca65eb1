//! Streams captured PNG frames into an ffmpeg process that writes one
//! alpha-preserving intermediate segment per chunk.

use super::cmd::{self, collect_stderr, diagnostic_tail, drain_stderr};
use crate::domain::chunks::Chunk;
use crate::domain::frame::Frame;
use crate::domain::jobs::Resolution;
use crate::error::RenderError;
use crate::ports::media::FrameSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeSettings {
    pub resolution: Resolution,
    pub fps: f64,
}

/// A finished intermediate file for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedSegment {
    pub index: usize,
    pub path: PathBuf,
    pub frame_count: u64,
    pub duration: f64,
}

/// Lossless or near-lossless codecs that keep the alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntermediateCodec {
    #[default]
    ProRes4444,
    Qtrle,
    Vp9Alpha,
}

impl IntermediateCodec {
    pub fn extension(&self) -> &'static str {
        match self {
            IntermediateCodec::ProRes4444 | IntermediateCodec::Qtrle => "mov",
            IntermediateCodec::Vp9Alpha => "webm",
        }
    }

    fn codec_args(&self) -> &'static [&'static str] {
        match self {
            IntermediateCodec::ProRes4444 => &[
                "-c:v",
                "prores_ks",
                "-profile:v",
                "4",
                "-pix_fmt",
                "yuva444p10le",
            ],
            IntermediateCodec::Qtrle => &["-c:v", "qtrle", "-pix_fmt", "argb"],
            IntermediateCodec::Vp9Alpha => &[
                "-c:v",
                "libvpx-vp9",
                "-pix_fmt",
                "yuva420p",
                "-b:v",
                "0",
                "-crf",
                "15",
                "-auto-alt-ref",
                "0",
            ],
        }
    }
}

impl FromStr for IntermediateCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prores" | "prores4444" | "prores_ks" => Ok(IntermediateCodec::ProRes4444),
            "qtrle" => Ok(IntermediateCodec::Qtrle),
            "vp9" | "vp9_alpha" => Ok(IntermediateCodec::Vp9Alpha),
            other => Err(format!("unknown intermediate codec '{}'", other)),
        }
    }
}

/// ffmpeg's textual form of a frame rate; NTSC rates are kept exact.
pub fn fps_arg(fps: f64) -> String {
    for (num, den) in [(24000, 1001), (30000, 1001), (60000, 1001)] {
        if (fps - num as f64 / den as f64).abs() < 1e-3 {
            return format!("{}/{}", num, den);
        }
    }
    if (fps - fps.round()).abs() < 1e-9 {
        format!("{}", fps.round() as u64)
    } else {
        format!("{}", fps)
    }
}

pub fn encoder_args(codec: IntermediateCodec, settings: &EncodeSettings, output: &Path) -> Vec<OsString> {
    let rate = fps_arg(settings.fps);
    let mut args: Vec<OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "image2pipe",
        "-framerate",
        rate.as_str(),
        "-c:v",
        "png",
        "-i",
        "pipe:0",
        "-an",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.extend(codec.codec_args().iter().map(OsString::from));
    args.push("-r".into());
    args.push(rate.into());
    args.push(output.as_os_str().to_owned());
    args
}

/// A running encoder for one chunk.
///
/// Frames must arrive in chunk order; every write waits until ffmpeg accepts
/// the bytes, which is what paces the renderer.
pub struct ChunkEncoder {
    chunk_index: usize,
    expected_frames: u64,
    frames_written: u64,
    fps: f64,
    output: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<io::Result<Vec<u8>>>>,
    grace: Duration,
}

impl ChunkEncoder {
    pub fn spawn(
        ffmpeg: &Path,
        codec: IntermediateCodec,
        chunk: &Chunk,
        settings: &EncodeSettings,
        output: &Path,
        grace: Duration,
    ) -> Result<Self, RenderError> {
        let mut command = cmd::command(ffmpeg);
        command.args(encoder_args(codec, settings, output));
        Self::spawn_command(command, chunk, settings.fps, output, grace)
    }

    pub fn spawn_command(
        mut command: Command,
        chunk: &Chunk,
        fps: f64,
        output: &Path,
        grace: Duration,
    ) -> Result<Self, RenderError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|e| {
            RenderError::EncoderUnavailable(format!("failed to start encoder: {}", e))
        })?;
        let stdin = child.stdin.take();
        let stderr = drain_stderr(child.stderr.take());

        debug!(
            "Encoder started for chunk {} ({} frames) -> {}",
            chunk.index,
            chunk.frame_count(fps),
            output.display()
        );

        Ok(Self {
            chunk_index: chunk.index,
            expected_frames: chunk.frame_count(fps),
            frames_written: 0,
            fps,
            output: output.to_path_buf(),
            child,
            stdin,
            stderr,
            grace,
        })
    }

    /// Close stdin and wait for ffmpeg, killing it if it hangs.
    async fn wait_for_exit(&mut self) -> (Option<ExitStatus>, String) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let status = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                warn!(
                    "Encoder for chunk {} did not exit after EOF, killing it",
                    self.chunk_index
                );
                let _ = self.child.kill().await;
                None
            }
        };
        let stderr = collect_stderr(self.stderr.take()).await;
        (status, diagnostic_tail(&stderr))
    }

    async fn fail(&mut self, fallback: String) -> RenderError {
        let (status, diagnostic) = self.wait_for_exit().await;
        remove_partial(&self.output).await;
        RenderError::Encoding {
            chunk_index: self.chunk_index,
            exit_code: status.and_then(|s| s.code()),
            diagnostic: if diagnostic.is_empty() {
                fallback
            } else {
                diagnostic
            },
        }
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial segment {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial segment {}: {}", path.display(), e),
    }
}

#[async_trait]
impl FrameSink for ChunkEncoder {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), RenderError> {
        if frame.index != self.frames_written || frame.index >= self.expected_frames {
            let message = format!(
                "frame {} out of order (expected {} of {})",
                frame.index, self.frames_written, self.expected_frames
            );
            return Err(self.fail(message).await);
        }

        let written = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(&frame.data).await,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder input closed")),
        };
        if let Err(e) = written {
            return Err(self.fail(format!("writing frame {}: {}", frame.index, e)).await);
        }
        self.frames_written += 1;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<EncodedSegment, RenderError> {
        if self.frames_written != self.expected_frames {
            let message = format!(
                "received {} of {} frames",
                self.frames_written, self.expected_frames
            );
            return Err(self.fail(message).await);
        }

        let (status, diagnostic) = self.wait_for_exit().await;
        let success = status.map(|s| s.success()).unwrap_or(false);
        if !success {
            remove_partial(&self.output).await;
            return Err(RenderError::Encoding {
                chunk_index: self.chunk_index,
                exit_code: status.and_then(|s| s.code()),
                diagnostic,
            });
        }
        if !tokio::fs::try_exists(&self.output).await.unwrap_or(false) {
            return Err(RenderError::Encoding {
                chunk_index: self.chunk_index,
                exit_code: status.and_then(|s| s.code()),
                diagnostic: format!("encoder produced no output at {}", self.output.display()),
            });
        }

        Ok(EncodedSegment {
            index: self.chunk_index,
            path: self.output.clone(),
            frame_count: self.frames_written,
            duration: self.frames_written as f64 / self.fps,
        })
    }

    async fn abort(mut self: Box<Self>) {
        let stdin = self.stdin.take();
        if let Ok(None) = self.child.try_wait() {
            debug!("Stopping encoder for chunk {}", self.chunk_index);
            cmd::stop_gracefully(&mut self.child, stdin, self.grace).await;
        }
        let _ = collect_stderr(self.stderr.take()).await;
        remove_partial(&self.output).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn frame(index: u64) -> Frame {
        Frame {
            index,
            global_index: index,
            timestamp: index as f64 / 10.0,
            data: Bytes::from_static(b"\x89PNG fake frame"),
        }
    }

    fn chunk() -> Chunk {
        Chunk {
            index: 1,
            start_time: 0.0,
            end_time: 0.3,
        }
    }

    #[test]
    fn test_fps_arg() {
        assert_eq!(fps_arg(30.0), "30");
        assert_eq!(fps_arg(29.97), "30000/1001");
        assert_eq!(fps_arg(12.5), "12.5");
    }

    #[test]
    fn test_encoder_args_read_png_pipe() {
        let settings = EncodeSettings {
            resolution: Resolution::new(1280, 720),
            fps: 30.0,
        };
        let args = encoder_args(IntermediateCodec::ProRes4444, &settings, Path::new("/tmp/s.mov"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let joined = args.join(" ");
        assert!(joined.contains("-f image2pipe -framerate 30 -c:v png -i pipe:0"));
        assert!(joined.contains("-c:v prores_ks -profile:v 4 -pix_fmt yuva444p10le"));
        assert_eq!(args.last().unwrap(), "/tmp/s.mov");
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("qtrle".parse(), Ok(IntermediateCodec::Qtrle));
        assert_eq!("VP9".parse(), Ok(IntermediateCodec::Vp9Alpha));
        assert!("h264".parse::<IntermediateCodec>().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finish_returns_segment() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("segment_0001.mov");
        let mut command = Command::new("sh");
        command.arg("-c").arg("cat > \"$0\"").arg(&output);

        let mut encoder = Box::new(
            ChunkEncoder::spawn_command(command, &chunk(), 10.0, &output, Duration::from_secs(5))
                .unwrap(),
        );
        for i in 0..3 {
            encoder.write_frame(&frame(i)).await.unwrap();
        }
        let segment = encoder.finish().await.unwrap();
        assert_eq!(segment.index, 1);
        assert_eq!(segment.frame_count, 3);
        assert!((segment.duration - 0.3).abs() < 1e-9);
        assert!(output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_exit_is_reported_with_chunk_index() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("segment_0001.mov");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("touch \"$0\"; echo 'Invalid data found' >&2; exit 3")
            .arg(&output);

        let mut encoder = Box::new(
            ChunkEncoder::spawn_command(command, &chunk(), 10.0, &output, Duration::from_secs(5))
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut result = Ok(());
        for i in 0..3 {
            result = encoder.write_frame(&frame(i)).await;
            if result.is_err() {
                break;
            }
        }
        let err = match result {
            Err(e) => e,
            Ok(()) => encoder.finish().await.unwrap_err(),
        };
        match err {
            RenderError::Encoding {
                chunk_index,
                exit_code,
                diagnostic,
            } => {
                assert_eq!(chunk_index, 1);
                assert_eq!(exit_code, Some(3));
                assert!(diagnostic.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_out_of_order_frame_is_rejected() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("segment_0001.mov");
        let mut command = Command::new("sh");
        command.arg("-c").arg("cat > /dev/null");

        let mut encoder =
            ChunkEncoder::spawn_command(command, &chunk(), 10.0, &output, Duration::from_secs(5))
                .unwrap();
        let err = encoder.write_frame(&frame(1)).await.unwrap_err();
        assert_eq!(err.chunk_index(), Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abort_lets_encoder_exit_cleanly() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("segment_0001.mov");
        let exited = dir.path().join("exited");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("touch \"$0\"; cat > /dev/null; touch \"$1\"")
            .arg(&output)
            .arg(&exited);

        let mut encoder = Box::new(
            ChunkEncoder::spawn_command(command, &chunk(), 10.0, &output, Duration::from_secs(5))
                .unwrap(),
        );
        encoder.write_frame(&frame(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        encoder.abort().await;

        assert!(exited.exists(), "encoder was killed before reaching EOF");
        assert!(!output.exists());
    }
}
