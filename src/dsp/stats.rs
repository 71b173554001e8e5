//! Per-channel spike statistics of a filtered segment.

use crate::dsp::detect::detect_spikes;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Half-width in frames of the detection neighbourhood.
pub const STATS_DETECT_WINDOW: usize = 10;

/// Contents of a `.stats.json` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpikeStats {
    /// Spikes per second on each channel
    pub mean_firing_rates: Vec<f64>,
    /// Mean absolute trough value of the spikes on each channel
    pub mean_spike_amplitudes: Vec<f64>,
}

pub fn compute_channel_spike_stats(
    data: &Array2<i16>,
    sampling_frequency: f64,
    threshold: f64,
) -> ChannelSpikeStats {
    let duration_sec = data.nrows() as f64 / sampling_frequency;
    let mut rates = Vec::with_capacity(data.ncols());
    let mut amplitudes = Vec::with_capacity(data.ncols());

    for column in data.columns() {
        let trace: Vec<f64> = column.iter().map(|&v| v as f64).collect();
        let spikes = detect_spikes(&trace, threshold, STATS_DETECT_WINDOW);

        let rate = if duration_sec > 0.0 {
            spikes.len() as f64 / duration_sec
        } else {
            0.0
        };
        let amplitude = if spikes.is_empty() {
            0.0
        } else {
            spikes.iter().map(|&t| -trace[t]).sum::<f64>() / spikes.len() as f64
        };
        rates.push(rate);
        amplitudes.push(amplitude);
    }

    ChannelSpikeStats {
        mean_firing_rates: rates,
        mean_spike_amplitudes: amplitudes,
    }
}
