//! Chunk planning and the frame rounding rule shared by the planner,
//! the renderer and the merger.

use crate::error::RenderError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Tolerance for float noise in `duration / chunk_size` and `time * fps`.
const EPSILON: f64 = 1e-9;

/// A contiguous, half-open slice `[start_time, end_time)` of the video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
}

impl Chunk {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Global frame indices rendered by this chunk.
    ///
    /// Adjacent chunks produce adjacent ranges, so a boundary frame is never
    /// dropped or rendered twice.
    pub fn frame_range(&self, fps: f64) -> Range<u64> {
        frame_boundary(self.start_time, fps)..frame_boundary(self.end_time, fps)
    }

    pub fn frame_count(&self, fps: f64) -> u64 {
        let range = self.frame_range(fps);
        range.end - range.start
    }
}

/// First global frame whose timestamp is at or after `time`.
pub fn frame_boundary(time: f64, fps: f64) -> u64 {
    let exact = time * fps;
    let rounded = (exact - EPSILON * exact.abs().max(1.0)).ceil();
    if rounded <= 0.0 {
        0
    } else {
        rounded as u64
    }
}

/// Number of frames for a whole video of `duration` seconds.
pub fn total_frames(duration: f64, fps: f64) -> u64 {
    frame_boundary(duration, fps)
}

/// Timestamp of a global frame index.
pub fn frame_timestamp(global_frame: u64, fps: f64) -> f64 {
    global_frame as f64 / fps
}

/// Split `[0, duration)` into consecutive chunks of at most `chunk_size`.
///
/// The last chunk may be shorter than `chunk_size`; none is empty.
pub fn plan(duration: f64, chunk_size: f64) -> Result<Vec<Chunk>, RenderError> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(RenderError::InvalidDuration(duration));
    }
    if !chunk_size.is_finite() || chunk_size <= 0.0 {
        return Err(RenderError::InvalidChunkSize(chunk_size));
    }

    let count = ((duration / chunk_size) - EPSILON).ceil().max(1.0) as usize;
    let chunks = (0..count)
        .map(|index| {
            let start_time = index as f64 * chunk_size;
            let end_time = if index + 1 == count {
                duration
            } else {
                (index + 1) as f64 * chunk_size
            };
            Chunk {
                index,
                start_time,
                end_time,
            }
        })
        .collect();
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(chunks: &[Chunk], duration: f64, chunk_size: f64) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start_time, 0.0);
        assert_eq!(chunks.last().unwrap().end_time, duration);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(chunk.start_time < chunk.end_time, "empty chunk {:?}", chunk);
            assert!(chunk.duration() <= chunk_size + 1e-9);
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
    }

    #[test]
    fn test_plan_25s_in_10s_chunks() {
        let chunks = plan(25.0, 10.0).unwrap();
        let bounds: Vec<(f64, f64)> = chunks.iter().map(|c| (c.start_time, c.end_time)).collect();
        assert_eq!(bounds, vec![(0.0, 10.0), (10.0, 20.0), (20.0, 25.0)]);

        let counts: Vec<u64> = chunks.iter().map(|c| c.frame_count(30.0)).collect();
        assert_eq!(counts, vec![300, 300, 150]);
        assert_eq!(counts.iter().sum::<u64>(), 750);
        assert_eq!(total_frames(25.0, 30.0), 750);
    }

    #[test]
    fn test_plan_rejects_bad_inputs() {
        assert!(matches!(plan(0.0, 10.0), Err(RenderError::InvalidDuration(_))));
        assert!(matches!(plan(-3.0, 10.0), Err(RenderError::InvalidDuration(_))));
        assert!(matches!(
            plan(f64::NAN, 10.0),
            Err(RenderError::InvalidDuration(_))
        ));
        assert!(matches!(plan(10.0, 0.0), Err(RenderError::InvalidChunkSize(_))));
        assert!(matches!(
            plan(10.0, f64::INFINITY),
            Err(RenderError::InvalidChunkSize(_))
        ));
    }

    #[test]
    fn test_plan_exact_multiple_has_no_trailing_sliver() {
        let chunks = plan(30.0, 10.0).unwrap();
        assert_eq!(chunks.len(), 3);
        let chunks = plan(0.3, 0.1).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_partition(&chunks, 0.3, 0.1);
    }

    #[test]
    fn test_plan_shorter_than_one_chunk() {
        let chunks = plan(4.2, 10.0).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end_time, 4.2);
    }

    #[test]
    fn test_plan_partitions_duration() {
        for &(duration, chunk_size) in &[
            (25.0, 10.0),
            (59.94, 7.5),
            (1.0, 0.3),
            (3600.0, 30.0),
            (12.345, 1.0),
            (0.04, 1.0),
        ] {
            let chunks = plan(duration, chunk_size).unwrap();
            assert_partition(&chunks, duration, chunk_size);
        }
    }

    #[test]
    fn test_frame_counts_sum_to_total() {
        for &(duration, chunk_size) in &[(25.0, 10.0), (59.94, 7.5), (10.01, 0.35), (1.0, 0.3)] {
            for &fps in &[24.0, 25.0, 29.97, 30.0, 60.0] {
                let chunks = plan(duration, chunk_size).unwrap();
                let sum: u64 = chunks.iter().map(|c| c.frame_count(fps)).sum();
                assert_eq!(
                    sum,
                    total_frames(duration, fps),
                    "duration={duration} chunk={chunk_size} fps={fps}"
                );
                for pair in chunks.windows(2) {
                    assert_eq!(pair[0].frame_range(fps).end, pair[1].frame_range(fps).start);
                }
            }
        }
    }

    #[test]
    fn test_plan_is_idempotent() {
        assert_eq!(plan(47.3, 6.0).unwrap(), plan(47.3, 6.0).unwrap());
    }

    #[test]
    fn test_frame_boundary_tolerates_float_noise() {
        // 0.1 * 3 * 30 is 9.000000000000002 in floating point
        assert_eq!(frame_boundary(0.1 * 3.0, 30.0), 9);
        assert_eq!(frame_boundary(0.0, 30.0), 0);
        assert_eq!(frame_boundary(1.0 / 60.0, 30.0), 1);
        assert_eq!(frame_timestamp(45, 30.0), 1.5);
    }
}
