//! Epoch-block aggregation of per-segment sortings.
//!
//! Every segment of a block is sorted into the reference label space, so the
//! segment sortings can be stitched together into one spike train covering
//! the whole block.

use crate::sorting::Sorting;
use ndarray::{Array1, Array2};
use tracing::info;

/// A sorted segment with its 1-based position in the block.
#[derive(Debug, Clone)]
pub struct SegmentSorting {
    pub number: u32,
    pub sorting: Sorting,
}

/// Start of segment `number` relative to the start of its block.
pub fn segment_offset_sec(number: u32, segment_duration_sec: f64) -> f64 {
    number.saturating_sub(1) as f64 * segment_duration_sec
}

/// Combine segment sortings into one epoch-block sorting.
///
/// Spikes are concatenated in ascending segment order with each segment's
/// offset added to its times. Templates are the spike-count weighted mean of
/// the segment templates of each label.
pub fn aggregate_epoch(
    mut segments: Vec<SegmentSorting>,
    segment_duration_sec: f64,
    n_channels: usize,
) -> Sorting {
    segments.sort_by_key(|s| s.number);

    let mut times: Vec<f32> = Vec::new();
    let mut labels: Vec<i32> = Vec::new();
    let mut amplitudes: Vec<f32> = Vec::new();
    for segment in &segments {
        let offset = segment_offset_sec(segment.number, segment_duration_sec);
        times.extend(
            segment
                .sorting
                .spike_times
                .iter()
                .map(|&t| (t as f64 + offset) as f32),
        );
        labels.extend(segment.sorting.spike_labels.iter().copied());
        amplitudes.extend(segment.sorting.spike_amplitudes.iter().copied());
    }

    let mut units = labels.clone();
    units.sort_unstable();
    units.dedup();

    let counts: Vec<_> = segments.iter().map(|s| s.sorting.spike_counts()).collect();
    let mut templates = Array2::<f32>::zeros((units.len(), n_channels));
    for (row, &label) in units.iter().enumerate() {
        let mut sum = vec![0.0f64; n_channels];
        let mut weight = 0usize;
        for (segment, counts) in segments.iter().zip(&counts) {
            let count = counts.get(&label).copied().unwrap_or(0);
            if count == 0 {
                continue;
            }
            if let Some(template) = segment.sorting.template_for(label) {
                for (acc, &v) in sum.iter_mut().zip(template.iter()) {
                    *acc += v as f64 * count as f64;
                }
                weight += count;
            }
        }
        if weight > 0 {
            for (ch, acc) in sum.into_iter().enumerate().take(n_channels) {
                templates[[row, ch]] = (acc / weight as f64) as f32;
            }
        }
    }

    info!(
        spikes = times.len(),
        segments = segments.len(),
        units = units.len(),
        "combined segment sortings"
    );

    Sorting {
        templates,
        spike_times: Array1::from(times),
        spike_labels: Array1::from(labels),
        spike_amplitudes: Array1::from(amplitudes),
    }
}
