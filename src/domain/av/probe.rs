use super::cmd::{self, RunError};
use crate::domain::jobs::Resolution;
use crate::error::RenderError;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// What the pipeline needs to know about a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration: f64,
    pub resolution: Resolution,
    pub fps: f64,
    pub video_codec: String,
    pub pix_fmt: Option<String>,
    pub audio_codec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_seconds(value: Option<&String>) -> Option<f64> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Build a `MediaInfo` from `ffprobe -print_format json -show_format -show_streams`.
pub fn parse_probe_output(json: &[u8]) -> Result<MediaInfo, RenderError> {
    let output: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| RenderError::Probe(format!("unreadable ffprobe output: {}", e)))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| RenderError::Probe("no video stream".into()))?;
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(RenderError::Probe("video stream has no dimensions".into())),
    };

    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| RenderError::Probe("video stream has no frame rate".into()))?;

    let duration = parse_seconds(output.format.as_ref().and_then(|f| f.duration.as_ref()))
        .or_else(|| parse_seconds(video.duration.as_ref()))
        .ok_or_else(|| RenderError::Probe("media has no duration".into()))?;

    Ok(MediaInfo {
        duration,
        resolution: Resolution::new(width, height),
        fps,
        video_codec: video.codec_name.clone().unwrap_or_default(),
        pix_fmt: video.pix_fmt.clone(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
    })
}

pub async fn probe(ffprobe: &Path, path: &Path) -> Result<MediaInfo, RenderError> {
    let mut cmd = cmd::command(ffprobe);
    cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path);

    let stdout = cmd::output(&mut cmd).await.map_err(|e| match e {
        RunError::Spawn(e) => RenderError::Probe(format!("failed to run ffprobe: {}", e)),
        RunError::Failed(failure) => RenderError::Probe(format!(
            "ffprobe rejected {}: {}",
            path.display(),
            failure.diagnostic
        )),
        RunError::Cancelled => RenderError::Cancelled,
    })?;

    let info = parse_probe_output(&stdout)?;
    debug!(
        "Probed {}: {} @ {:.3} fps, {:.3}s, codec {}",
        path.display(),
        info.resolution,
        info.fps,
        info.duration,
        info.video_codec
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video", "width": 1920, "height": 1080,
             "pix_fmt": "yuv420p", "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001",
             "duration": "24.991633"},
            {"index": 1, "codec_name": "aac", "codec_type": "audio", "sample_rate": "48000"}
        ],
        "format": {"filename": "in.mp4", "duration": "25.000000"}
    }"#;

    #[test]
    fn test_parse_source_video() {
        let info = parse_probe_output(SOURCE.as_bytes()).unwrap();
        assert_eq!(info.resolution, Resolution::new(1920, 1080));
        assert!((info.fps - 29.97).abs() < 0.001);
        assert_eq!(info.duration, 25.0);
        assert_eq!(info.video_codec, "h264");
        assert_eq!(info.pix_fmt.as_deref(), Some("yuv420p"));
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
    }

    #[test]
    fn test_parse_without_audio_falls_back_to_stream_duration() {
        let json = r#"{
            "streams": [{"codec_name": "prores", "codec_type": "video", "width": 1280, "height": 720,
                         "pix_fmt": "yuva444p10le", "r_frame_rate": "0/0", "avg_frame_rate": "30/1",
                         "duration": "10.000000"}],
            "format": {}
        }"#;
        let info = parse_probe_output(json.as_bytes()).unwrap();
        assert_eq!(info.fps, 30.0);
        assert_eq!(info.duration, 10.0);
        assert_eq!(info.audio_codec, None);
    }

    #[test]
    fn test_parse_rejects_audio_only() {
        let json = r#"{"streams": [{"codec_type": "audio", "codec_name": "mp3"}],
                       "format": {"duration": "3.0"}}"#;
        assert!(matches!(
            parse_probe_output(json.as_bytes()),
            Err(RenderError::Probe(_))
        ));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("60/1"), Some(60.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }
}
