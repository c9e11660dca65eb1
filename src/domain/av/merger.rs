//! Lossless concatenation of chunk segments with the concat demuxer.

use super::encoder::EncodedSegment;
use super::probe::MediaInfo;
use crate::error::RenderError;
use std::ffi::OsString;
use std::path::Path;

/// Concat demuxer manifest, one `file '<path>'` line per segment.
pub fn concat_manifest(segments: &[EncodedSegment]) -> String {
    segments
        .iter()
        .map(|s| {
            let path = s.path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

pub fn concat_args(manifest: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-y", "-f", "concat", "-safe", "0", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(manifest.as_os_str().to_owned());
    args.extend(["-c", "copy"].iter().map(OsString::from));
    args.push(output.as_os_str().to_owned());
    args
}

/// Segments must agree on codec, pixel format, resolution and frame rate or
/// stream copy would produce a broken file.
pub fn check_compatible(infos: &[(usize, MediaInfo)]) -> Result<(), RenderError> {
    let Some((first_index, first)) = infos.first() else {
        return Err(RenderError::IncompatibleSegments("no segments to merge".into()));
    };
    for (index, info) in &infos[1..] {
        let mismatch = if info.video_codec != first.video_codec {
            Some(format!("codec {} vs {}", info.video_codec, first.video_codec))
        } else if info.pix_fmt != first.pix_fmt {
            Some(format!("pixel format {:?} vs {:?}", info.pix_fmt, first.pix_fmt))
        } else if info.resolution != first.resolution {
            Some(format!("resolution {} vs {}", info.resolution, first.resolution))
        } else if (info.fps - first.fps).abs() > 0.01 {
            Some(format!("frame rate {} vs {}", info.fps, first.fps))
        } else {
            None
        };
        if let Some(mismatch) = mismatch {
            return Err(RenderError::IncompatibleSegments(format!(
                "segment {} differs from segment {}: {}",
                index, first_index, mismatch
            )));
        }
    }
    Ok(())
}

/// Segment indices must be strictly increasing.
pub fn check_order(segments: &[EncodedSegment]) -> Result<(), RenderError> {
    for pair in segments.windows(2) {
        if pair[1].index <= pair[0].index {
            return Err(RenderError::IncompatibleSegments(format!(
                "segment {} listed after segment {}",
                pair[1].index, pair[0].index
            )));
        }
    }
    Ok(())
}
