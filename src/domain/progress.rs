//! Progress sub-ranges and a monotonic percentage tracker.

use serde::{Deserialize, Serialize};

/// Portion of the 0–100 scale assigned to one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRange {
    pub start: u8,
    pub end: u8,
}

impl ProgressRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Map a completion fraction in `[0, 1]` into this range.
    pub fn at(&self, fraction: f64) -> u8 {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let span = self.end.saturating_sub(self.start) as f64;
        self.start + (span * fraction).floor() as u8
    }
}

/// Never reports a lower percentage than it already reported.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    current: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u8 {
        self.current
    }

    /// Returns the new value when it advanced.
    pub fn advance(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        if percent > self.current {
            self.current = percent;
            Some(percent)
        } else {
            None
        }
    }
}

/// Chunk completion weighted by each chunk's share of the total frames.
#[derive(Debug)]
pub struct WeightedCompletion {
    weights: Vec<u64>,
    total: u64,
    done: u64,
}

impl WeightedCompletion {
    pub fn new(weights: Vec<u64>) -> Self {
        let total = weights.iter().sum();
        Self {
            weights,
            total,
            done: 0,
        }
    }

    pub fn complete(&mut self, index: usize) -> f64 {
        if let Some(weight) = self.weights.get_mut(index) {
            self.done += *weight;
            *weight = 0;
        }
        self.fraction()
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_mapping() {
        let rendering = ProgressRange::new(20, 75);
        assert_eq!(rendering.at(0.0), 20);
        assert_eq!(rendering.at(0.5), 47);
        assert_eq!(rendering.at(1.0), 75);
        assert_eq!(rendering.at(7.0), 75);
        assert_eq!(rendering.at(f64::NAN), 20);
    }

    #[test]
    fn test_tracker_is_monotonic() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.advance(10), Some(10));
        assert_eq!(tracker.advance(5), None);
        assert_eq!(tracker.advance(10), None);
        assert_eq!(tracker.advance(250), Some(100));
        assert_eq!(tracker.current(), 100);
    }

    #[test]
    fn test_weighted_completion() {
        let mut completion = WeightedCompletion::new(vec![300, 300, 150]);
        assert_eq!(completion.complete(2), 0.2);
        assert_eq!(completion.complete(2), 0.2);
        assert_eq!(completion.complete(0), 0.6);
        assert_eq!(completion.complete(1), 1.0);
    }
}
