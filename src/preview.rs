//! Preview bundles.
//!
//! A preview is a JSON document collecting everything a viewer needs to
//! summarize a segment or an epoch block without touching the sample files.

use crate::diagnostics::{cluster_separation, unit_autocorrelograms, Autocorrelogram, SeparationItem};
use crate::dsp::{ChannelSpikeStats, Interval};
use crate::sorting::Sorting;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Templates and diagnostics of one sorting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortingView {
    pub unit_ids: Vec<i32>,
    /// One row per unit, in `unit_ids` order
    pub templates: Vec<Vec<f32>>,
    pub spike_counts: Vec<usize>,
    pub autocorrelograms: Vec<Autocorrelogram>,
    pub cluster_separation: Vec<SeparationItem>,
    /// Spikes whose frame falls inside the shifted data
    pub spike_frame_count: usize,
}

impl SortingView {
    /// Build the view. Cluster separation and spike frames need the shifted
    /// samples the sorting was computed from.
    pub fn build(sorting: &Sorting, shifted: Option<&Array2<i16>>, fs: f64, neighbors: usize) -> Self {
        let unit_ids = sorting.unique_labels();
        let counts = sorting.spike_counts();
        let times = sorting.spike_times.to_vec();
        let labels = sorting.spike_labels.to_vec();

        let (cluster_separation, spike_frame_count) = match shifted {
            Some(data) => {
                let n_frames = data.nrows();
                let in_range = times
                    .iter()
                    .filter(|&&t| {
                        let f = (t as f64 * fs).round();
                        f >= 0.0 && (f as usize) < n_frames
                    })
                    .count();
                (cluster_separation(sorting, data, fs, neighbors), in_range)
            }
            None => (Vec::new(), 0),
        };

        Self {
            templates: sorting.templates.rows().into_iter().map(|r| r.to_vec()).collect(),
            spike_counts: unit_ids
                .iter()
                .map(|u| counts.get(u).copied().unwrap_or(0))
                .collect(),
            autocorrelograms: unit_autocorrelograms(&times, &labels),
            cluster_separation,
            spike_frame_count,
            unit_ids,
        }
    }
}

/// Contents of a `segment_NNN.bin.preview.json` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPreview {
    pub block: String,
    pub segment: String,
    pub sampling_frequency: f64,
    pub electrode_coords: Vec<(f64, f64)>,
    pub stats: ChannelSpikeStats,
    pub high_activity_intervals: Vec<Interval>,
    /// Present only for the reference segment
    pub reference_sorting: Option<SortingView>,
    /// Present when the segment had been sorted when the preview was built
    pub spike_sorting: Option<SortingView>,
}

/// Firing rate of one unit in every segment of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFiringRates {
    pub unit_id: i32,
    /// Spikes per second, one value per segment
    pub rates_hz: Vec<f64>,
}

/// Contents of an `epoch_block.preview.json` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochPreview {
    pub block: String,
    pub num_segments: usize,
    pub segment_duration_sec: f64,
    pub electrode_coords: Vec<(f64, f64)>,
    pub num_spikes: usize,
    pub sorting: SortingView,
    pub firing_rates: Vec<UnitFiringRates>,
}

/// Per-unit firing rate in consecutive segment-length bins of an epoch
/// sorting. Spikes past the last segment are ignored.
pub fn unit_firing_rates(
    sorting: &Sorting,
    num_segments: usize,
    segment_duration_sec: f64,
) -> Vec<UnitFiringRates> {
    sorting
        .unique_labels()
        .into_iter()
        .map(|unit| {
            let mut counts = vec![0usize; num_segments];
            if segment_duration_sec > 0.0 {
                for t in sorting.spike_train(unit) {
                    let bin = (t / segment_duration_sec).floor();
                    if bin >= 0.0 && (bin as usize) < num_segments {
                        counts[bin as usize] += 1;
                    }
                }
            }
            UnitFiringRates {
                unit_id: unit,
                rates_hz: counts
                    .into_iter()
                    .map(|c| {
                        if segment_duration_sec > 0.0 {
                            c as f64 / segment_duration_sec
                        } else {
                            0.0
                        }
                    })
                    .collect(),
            }
        })
        .collect()
}

impl EpochPreview {
    pub fn build(
        block: &str,
        sorting: &Sorting,
        num_segments: usize,
        segment_duration_sec: f64,
        fs: f64,
        electrode_coords: Vec<(f64, f64)>,
    ) -> Self {
        Self {
            block: block.to_string(),
            num_segments,
            segment_duration_sec,
            electrode_coords,
            num_spikes: sorting.num_spikes(),
            sorting: SortingView::build(sorting, None, fs, 0),
            firing_rates: unit_firing_rates(sorting, num_segments, segment_duration_sec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SEPARATION_NEIGHBORS;
    use ndarray::array;

    fn sorting() -> Sorting {
        Sorting {
            templates: array![[-40.0, 0.0], [0.0, -60.0]],
            spike_times: array![0.010, 0.012, 0.5, 2.5, 2.6, 3.9],
            spike_labels: array![3, 3, 7, 3, 7, 7],
            spike_amplitudes: array![40.0, 40.0, 60.0, 40.0, 60.0, 60.0],
        }
    }

    #[test]
    fn test_firing_rates_per_segment() {
        let rates = unit_firing_rates(&sorting(), 2, 2.0);
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].unit_id, 3);
        assert_eq!(rates[0].rates_hz, vec![1.0, 0.5]);
        assert_eq!(rates[1].rates_hz, vec![0.5, 1.0]);
    }

    #[test]
    fn test_sorting_view_without_samples() {
        let view = SortingView::build(&sorting(), None, 1000.0, SEPARATION_NEIGHBORS);
        assert_eq!(view.unit_ids, vec![3, 7]);
        assert_eq!(view.spike_counts, vec![3, 3]);
        assert_eq!(view.templates[1], vec![0.0, -60.0]);
        assert!(view.cluster_separation.is_empty());
        assert_eq!(view.spike_frame_count, 0);
        // unit 3 has one pair 2 ms apart
        assert_eq!(view.autocorrelograms[0].total(), 2);
    }

    #[test]
    fn test_spike_frames_clipped_to_data() {
        let shifted = Array2::<i16>::zeros((1000, 2));
        let view = SortingView::build(&sorting(), Some(&shifted), 1000.0, SEPARATION_NEIGHBORS);
        // only the first three spikes fall inside the first second
        assert_eq!(view.spike_frame_count, 3);
    }

    #[test]
    fn test_epoch_preview_serializes() {
        let preview = EpochPreview::build("block_a", &sorting(), 2, 2.0, 1000.0, vec![(0.0, 0.0), (1.0, 0.0)]);
        let json = serde_json::to_string(&preview).unwrap();
        let back: EpochPreview = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_spikes, 6);
        assert_eq!(back.firing_rates.len(), 2);
    }
}
