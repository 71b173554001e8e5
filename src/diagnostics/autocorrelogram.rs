//! Spike-train autocorrelograms.

use serde::{Deserialize, Serialize};

pub const BIN_SIZE_MS: f64 = 1.0;
pub const WINDOW_MS: f64 = 100.0;

/// Histogram of intra-unit spike time differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autocorrelogram {
    pub unit_id: i32,
    /// `bin_counts.len() + 1` edges, in seconds, symmetric around zero
    pub bin_edges_sec: Vec<f64>,
    pub bin_counts: Vec<u32>,
}

impl Autocorrelogram {
    pub fn total(&self) -> u64 {
        self.bin_counts.iter().map(|&c| c as u64).sum()
    }
}

/// Bin edges in milliseconds. The bin count is forced odd so that one bin is
/// centred on zero.
pub fn bin_edges_ms(bin_size_ms: f64, window_ms: f64) -> Vec<f64> {
    let mut num_bins = (window_ms / bin_size_ms) as usize;
    if num_bins % 2 == 0 {
        num_bins = num_bins.saturating_sub(1);
    }
    (0..=num_bins)
        .map(|i| (i as f64 - num_bins as f64 / 2.0) * bin_size_ms)
        .collect()
}

/// Autocorrelogram counts of one spike train (seconds).
///
/// Differences are taken between each spike and its `offset`-th successor for
/// increasing offsets, stopping once an offset yields no difference inside
/// the window. Each positive difference is counted in its bin and the mirror
/// bin, so the total is the number of ordered pairs within the window.
pub fn autocorrelogram_counts(spike_train: &[f64], bin_size_ms: f64, window_ms: f64) -> (Vec<f64>, Vec<u32>) {
    let edges = bin_edges_ms(bin_size_ms, window_ms);
    let num_bins = edges.len() - 1;
    let mut counts = vec![0u32; num_bins];
    if num_bins == 0 {
        return (edges, counts);
    }
    let half = (num_bins + 1) / 2;
    let limit = edges[num_bins];

    let mut times = spike_train.to_vec();
    times.sort_by(f64::total_cmp);

    for offset in 1..times.len() {
        let deltas: Vec<f64> = times
            .iter()
            .zip(&times[offset..])
            .map(|(a, b)| (b - a) * 1000.0)
            .filter(|&d| d <= limit)
            .collect();
        if deltas.is_empty() {
            break;
        }
        for i in 0..half {
            let lo = edges[half - 1 + i];
            let hi = edges[half + i];
            let n = deltas.iter().filter(|&&d| lo <= d && d < hi).count() as u32;
            counts[half - 1 + i] += n;
            counts[half - 1 - i] += n;
        }
    }
    (edges, counts)
}

/// Autocorrelograms of every unit with at least two spikes, in label order.
pub fn unit_autocorrelograms(spike_times: &[f32], spike_labels: &[i32]) -> Vec<Autocorrelogram> {
    let mut units: Vec<i32> = spike_labels.to_vec();
    units.sort_unstable();
    units.dedup();

    units
        .into_iter()
        .filter_map(|unit| {
            let train: Vec<f64> = spike_times
                .iter()
                .zip(spike_labels)
                .filter(|(_, l)| **l == unit)
                .map(|(&t, _)| t as f64)
                .collect();
            if train.len() < 2 {
                return None;
            }
            let (edges, bin_counts) = autocorrelogram_counts(&train, BIN_SIZE_MS, WINDOW_MS);
            Some(Autocorrelogram {
                unit_id: unit,
                bin_edges_sec: edges.into_iter().map(|e| e / 1000.0).collect(),
                bin_counts,
            })
        })
        .collect()
}
