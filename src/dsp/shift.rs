//! Time-shift alignment across the array.
//!
//! Each channel is delayed by `(c_x * x + c_y * y) * fs` frames, where
//! `(x, y)` is the electrode position. The coefficients are estimated once
//! from the reference segment by maximizing the variance of the channel sum,
//! which peaks when a propagating wavefront lines up across channels.

use crate::config::ElectrodeCoords;
use crate::dsp::bandpass::saturate_i16;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Length of the reference excerpt used for estimation.
pub const SHIFT_ESTIMATION_SEC: f64 = 0.5;

/// Half-width of the coarse search grid, in seconds per coordinate unit.
pub const SHIFT_SEARCH_RANGE: f64 = 2e-6;

/// Grid points per axis at each refinement level.
const GRID_POINTS: usize = 11;

/// Contents of `shift_coeffs.yaml`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShiftCoefficients {
    pub c_x: f64,
    pub c_y: f64,
}

impl ShiftCoefficients {
    /// Per-channel delay in frames.
    pub fn delays(&self, coords: &ElectrodeCoords, fs: f64) -> Vec<f64> {
        coords
            .positions()
            .iter()
            .map(|&(x, y)| (self.c_x * x + self.c_y * y) * fs)
            .collect()
    }
}

/// Linear interpolation of `trace` at fractional index `pos`, clamped to
/// the ends.
fn sample_at(trace: &[f64], pos: f64) -> f64 {
    let last = trace.len() - 1;
    if pos <= 0.0 {
        return trace[0];
    }
    if pos >= last as f64 {
        return trace[last];
    }
    let i = pos.floor() as usize;
    let frac = pos - i as f64;
    trace[i] * (1.0 - frac) + trace[i + 1] * frac
}

fn shifted_trace(trace: &[f64], delay: f64) -> impl Iterator<Item = f64> + '_ {
    (0..trace.len()).map(move |t| sample_at(trace, t as f64 + delay))
}

fn columns_f64(data: &Array2<i16>, n_frames: usize) -> Vec<Vec<f64>> {
    data.columns()
        .into_iter()
        .map(|c| c.iter().take(n_frames).map(|&v| v as f64).collect())
        .collect()
}

/// Apply per-channel delays to a frames-by-channels matrix.
pub fn apply_time_shifts(
    data: &Array2<i16>,
    coeffs: &ShiftCoefficients,
    coords: &ElectrodeCoords,
    fs: f64,
) -> Array2<i16> {
    let mut out = Array2::<i16>::zeros(data.raw_dim());
    if data.nrows() == 0 {
        return out;
    }
    let delays = coeffs.delays(coords, fs);
    for (ch, trace) in columns_f64(data, data.nrows()).iter().enumerate() {
        for (t, value) in shifted_trace(trace, delays[ch]).enumerate() {
            out[[t, ch]] = saturate_i16(value);
        }
    }
    out
}

/// Variance of the channel-summed signal after shifting.
fn alignment_score(traces: &[Vec<f64>], coords: &ElectrodeCoords, fs: f64, c_x: f64, c_y: f64) -> f64 {
    let n = traces.first().map(|t| t.len()).unwrap_or(0);
    if n == 0 {
        return 0.0;
    }
    let delays = ShiftCoefficients { c_x, c_y }.delays(coords, fs);
    let mut sum = vec![0.0; n];
    for (trace, &delay) in traces.iter().zip(&delays) {
        for (acc, value) in sum.iter_mut().zip(shifted_trace(trace, delay)) {
            *acc += value;
        }
    }
    let mean = sum.iter().sum::<f64>() / n as f64;
    sum.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
}

fn linspace(center: f64, half_width: f64) -> impl Iterator<Item = f64> {
    let step = 2.0 * half_width / (GRID_POINTS - 1) as f64;
    let mid = (GRID_POINTS / 2) as f64;
    (0..GRID_POINTS).map(move |i| center + step * (i as f64 - mid))
}

/// Estimate shift coefficients from the start of a filtered reference
/// segment with a coarse grid search followed by one refinement.
pub fn optimize_time_shift(
    filtered: &Array2<i16>,
    coords: &ElectrodeCoords,
    fs: f64,
) -> ShiftCoefficients {
    let n_frames = ((SHIFT_ESTIMATION_SEC * fs) as usize).min(filtered.nrows());
    let traces = columns_f64(filtered, n_frames);

    let mut best = ShiftCoefficients::default();
    let mut best_score = alignment_score(&traces, coords, fs, 0.0, 0.0);

    let mut center = best;
    let mut half_width = SHIFT_SEARCH_RANGE;
    for level in 0..2 {
        for c_x in linspace(center.c_x, half_width) {
            for c_y in linspace(center.c_y, half_width) {
                let score = alignment_score(&traces, coords, fs, c_x, c_y);
                // equal scores prefer the smaller shift
                let smaller = c_x.hypot(c_y) < best.c_x.hypot(best.c_y);
                if score > best_score || (score == best_score && smaller) {
                    best_score = score;
                    best = ShiftCoefficients { c_x, c_y };
                }
            }
        }
        debug!(level, c_x = best.c_x, c_y = best.c_y, score = best_score, "shift search");
        center = best;
        half_width /= (GRID_POINTS - 1) as f64 / 2.0;
    }

    best
}
