//! Final alpha composite of the merged overlay onto the source video.

use super::encoder::fps_arg;
use super::probe::MediaInfo;
use crate::domain::jobs::{OutputFormat, Resolution};
use crate::error::RenderError;
use regex::Regex;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Frame rates closer than this are treated as equal.
const FPS_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRequest {
    pub source: PathBuf,
    pub overlay: PathBuf,
    pub output: PathBuf,
    pub format: OutputFormat,
    pub resolution: Resolution,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoder {
    Nvenc,
    X264,
    Vp9,
}

impl VideoEncoder {
    /// Pick the delivery encoder. Hardware H.264 only when available and wanted.
    pub fn select(format: OutputFormat, hardware_available: bool, prefer_hardware: bool) -> Self {
        match format {
            OutputFormat::Webm => VideoEncoder::Vp9,
            OutputFormat::Mp4 if hardware_available && prefer_hardware => VideoEncoder::Nvenc,
            OutputFormat::Mp4 => VideoEncoder::X264,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, VideoEncoder::Nvenc)
    }

    fn args(&self) -> &'static [&'static str] {
        match self {
            VideoEncoder::Nvenc => &[
                "-c:v", "h264_nvenc", "-preset", "p4", "-rc", "vbr", "-cq", "19", "-b:v", "0",
            ],
            VideoEncoder::X264 => &["-c:v", "libx264", "-preset", "medium", "-crf", "18"],
            VideoEncoder::Vp9 => &[
                "-c:v", "libvpx-vp9", "-crf", "30", "-b:v", "0", "-row-mt", "1",
            ],
        }
    }
}

/// Audio is copied when the container accepts it as-is.
pub fn audio_args(format: OutputFormat, source_audio: Option<&str>) -> Vec<&'static str> {
    match (format, source_audio) {
        (_, None) => vec!["-an"],
        (OutputFormat::Mp4, Some(_)) => vec!["-c:a", "copy"],
        (OutputFormat::Webm, Some("opus" | "vorbis")) => vec!["-c:a", "copy"],
        (OutputFormat::Webm, Some(_)) => vec!["-c:a", "libopus", "-b:a", "128k"],
    }
}

pub fn composite_args(
    request: &CompositeRequest,
    encoder: VideoEncoder,
    source_audio: Option<&str>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into()];
    args.push("-i".into());
    args.push(request.source.as_os_str().to_owned());
    args.push("-i".into());
    args.push(request.overlay.as_os_str().to_owned());
    args.extend(
        [
            "-filter_complex",
            "[0:v][1:v]overlay=0:0:format=auto:eof_action=pass[vout]",
            "-map",
            "[vout]",
            "-map",
            "0:a?",
        ]
        .iter()
        .map(OsString::from),
    );
    args.extend(encoder.args().iter().map(OsString::from));
    args.extend(["-pix_fmt", "yuv420p", "-r"].iter().map(OsString::from));
    args.push(fps_arg(request.fps).into());
    args.extend(audio_args(request.format, source_audio).into_iter().map(OsString::from));
    if request.format == OutputFormat::Mp4 {
        args.extend(["-movflags", "+faststart"].iter().map(OsString::from));
    }
    args.extend(["-progress", "pipe:1", "-nostats"].iter().map(OsString::from));
    args.push(request.output.as_os_str().to_owned());
    args
}

/// Source and overlay must share the job's resolution and frame rate.
pub fn validate_inputs(
    request: &CompositeRequest,
    source: &MediaInfo,
    overlay: &MediaInfo,
) -> Result<(), RenderError> {
    check_geometry(request.resolution, request.fps, source)?;
    check_geometry(request.resolution, request.fps, overlay)
}

/// Fail when `info` does not have exactly the given resolution and frame rate.
pub fn check_geometry(
    resolution: Resolution,
    fps: f64,
    info: &MediaInfo,
) -> Result<(), RenderError> {
    if info.resolution != resolution {
        return Err(RenderError::ResolutionMismatch {
            expected: resolution.to_string(),
            actual: info.resolution.to_string(),
        });
    }
    if (info.fps - fps).abs() > FPS_TOLERANCE {
        return Err(RenderError::FrameRateMismatch {
            expected: fps,
            actual: info.fps,
        });
    }
    Ok(())
}

fn out_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^out_time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?)$").expect("valid out_time regex")
    })
}

/// Seconds encoded so far, from an ffmpeg `-progress` line.
pub fn parse_out_time(line: &str) -> Option<f64> {
    let caps = out_time_regex().captures(line.trim())?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format: OutputFormat) -> CompositeRequest {
        CompositeRequest {
            source: PathBuf::from("/tmp/job/source.mp4"),
            overlay: PathBuf::from("/tmp/job/overlay.mov"),
            output: PathBuf::from("/tmp/job/output.mp4"),
            format,
            resolution: Resolution::new(1920, 1080),
            fps: 30.0,
        }
    }

    fn info(width: u32, height: u32, fps: f64) -> MediaInfo {
        MediaInfo {
            duration: 25.0,
            resolution: Resolution::new(width, height),
            fps,
            video_codec: "h264".into(),
            pix_fmt: Some("yuv420p".into()),
            audio_codec: Some("aac".into()),
        }
    }

    fn joined(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_encoder_selection() {
        assert_eq!(VideoEncoder::select(OutputFormat::Mp4, true, true), VideoEncoder::Nvenc);
        assert_eq!(VideoEncoder::select(OutputFormat::Mp4, true, false), VideoEncoder::X264);
        assert_eq!(VideoEncoder::select(OutputFormat::Mp4, false, true), VideoEncoder::X264);
        assert_eq!(VideoEncoder::select(OutputFormat::Webm, true, true), VideoEncoder::Vp9);
    }

    #[test]
    fn test_audio_rules() {
        assert_eq!(audio_args(OutputFormat::Mp4, Some("aac")), vec!["-c:a", "copy"]);
        assert_eq!(audio_args(OutputFormat::Webm, Some("opus")), vec!["-c:a", "copy"]);
        assert_eq!(
            audio_args(OutputFormat::Webm, Some("aac")),
            vec!["-c:a", "libopus", "-b:a", "128k"]
        );
        assert_eq!(audio_args(OutputFormat::Mp4, None), vec!["-an"]);
    }

    #[test]
    fn test_composite_args() {
        let args = joined(&composite_args(&request(OutputFormat::Mp4), VideoEncoder::X264, Some("aac")));
        assert!(args.contains("-i /tmp/job/source.mp4 -i /tmp/job/overlay.mov"));
        assert!(args.contains("[0:v][1:v]overlay=0:0"));
        assert!(args.contains("-map [vout] -map 0:a?"));
        assert!(args.contains("-c:v libx264"));
        assert!(args.contains("-pix_fmt yuv420p"));
        assert!(args.contains("-c:a copy"));
        assert!(args.contains("-progress pipe:1"));
        assert!(args.ends_with("/tmp/job/output.mp4"));

        let webm = joined(&composite_args(&request(OutputFormat::Webm), VideoEncoder::Vp9, None));
        assert!(webm.contains("-c:v libvpx-vp9"));
        assert!(webm.contains("-an"));
        assert!(!webm.contains("faststart"));
    }

    #[test]
    fn test_validate_inputs() {
        let req = request(OutputFormat::Mp4);
        assert!(validate_inputs(&req, &info(1920, 1080, 30.0), &info(1920, 1080, 30.0)).is_ok());
        assert!(matches!(
            validate_inputs(&req, &info(1280, 720, 30.0), &info(1920, 1080, 30.0)),
            Err(RenderError::ResolutionMismatch { .. })
        ));
        assert!(matches!(
            validate_inputs(&req, &info(1920, 1080, 30.0), &info(1920, 1080, 25.0)),
            Err(RenderError::FrameRateMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_out_time() {
        assert_eq!(parse_out_time("out_time=00:00:12.500000"), Some(12.5));
        assert_eq!(parse_out_time("out_time=01:02:03.000000"), Some(3723.0));
        assert_eq!(parse_out_time("out_time_ms=12500000"), None);
        assert_eq!(parse_out_time("progress=continue"), None);
    }
}
