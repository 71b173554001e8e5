//! Detection of high-activity intervals.
//!
//! The segment is cut into short bins and the RMS over all channels is taken
//! per bin. Bins louder than `threshold` times the median bin RMS are flagged
//! and consecutive flagged bins are merged into one interval.

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

/// Bin length used for the RMS envelope.
pub const HIGH_ACTIVITY_BIN_SEC: f64 = 0.05;

/// A span of a segment, in seconds from its start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start_sec: f64,
    pub end_sec: f64,
}

impl Interval {
    pub fn duration_sec(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    /// Frame range `[start, end)` covered by the interval, clamped to
    /// `n_frames`.
    pub fn frame_range(&self, fs: f64, n_frames: usize) -> (usize, usize) {
        let start = ((self.start_sec * fs).floor().max(0.0) as usize).min(n_frames);
        let end = ((self.end_sec * fs).ceil().max(0.0) as usize).min(n_frames);
        (start, end.max(start))
    }
}

/// Contents of a `.high_activity.json` artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HighActivity {
    pub high_activity_intervals: Vec<Interval>,
}

impl HighActivity {
    pub fn total_duration_sec(&self) -> f64 {
        self.high_activity_intervals
            .iter()
            .map(Interval::duration_sec)
            .sum()
    }
}

/// Find high-activity intervals. A `threshold` of 0 disables detection.
pub fn detect_high_activity(data: &Array2<i16>, fs: f64, threshold: f64) -> HighActivity {
    let n_frames = data.nrows();
    if threshold <= 0.0 || n_frames == 0 || data.ncols() == 0 {
        return HighActivity::default();
    }

    let bin_frames = ((HIGH_ACTIVITY_BIN_SEC * fs).round() as usize).max(1);
    let n_bins = (n_frames + bin_frames - 1) / bin_frames;

    let rms: Vec<f64> = (0..n_bins)
        .map(|b| {
            let start = b * bin_frames;
            let end = (start + bin_frames).min(n_frames);
            let bin = data.slice(s![start..end, ..]);
            let sum_sq: f64 = bin.iter().map(|&v| (v as f64) * (v as f64)).sum();
            (sum_sq / bin.len() as f64).sqrt()
        })
        .collect();

    // a mostly silent segment has no baseline to compare against
    let median = Data::new(rms.clone()).median();
    if !(median > 0.0) {
        return HighActivity::default();
    }
    let limit = threshold * median;

    let mut intervals: Vec<Interval> = Vec::new();
    let mut open: Option<usize> = None;
    for (b, &value) in rms.iter().enumerate() {
        match (value > limit, open) {
            (true, None) => open = Some(b),
            (false, Some(first)) => {
                intervals.push(bin_interval(first, b, bin_frames, n_frames, fs));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(first) = open {
        intervals.push(bin_interval(first, n_bins, bin_frames, n_frames, fs));
    }

    HighActivity {
        high_activity_intervals: intervals,
    }
}

fn bin_interval(first: usize, end: usize, bin_frames: usize, n_frames: usize, fs: f64) -> Interval {
    Interval {
        start_sec: (first * bin_frames) as f64 / fs,
        end_sec: (end * bin_frames).min(n_frames) as f64 / fs,
    }
}
