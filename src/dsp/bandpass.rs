//! Zero-phase Butterworth band-pass filtering.
//!
//! The band-pass is a high-pass at `lowcut` followed by a low-pass at
//! `highcut`, each of the configured order, realised as cascaded
//! second-order sections and run forward then backward over each channel.

use crate::config::FilterParams;
use ndarray::Array2;
use std::f64::consts::PI;

/// Normalized second-order section, `a0 == 1`.
///
/// y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - a1*y[n-1] - a2*y[n-2]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// RBJ low-pass section with quality factor `q`.
    pub fn lowpass(fs: f64, cutoff: f64, q: f64) -> Self {
        let omega = 2.0 * PI * cutoff / fs;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let b0 = (1.0 - cos_w) / 2.0;
        Self::normalized(b0, 1.0 - cos_w, b0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
    }

    /// RBJ high-pass section with quality factor `q`.
    pub fn highpass(fs: f64, cutoff: f64, q: f64) -> Self {
        let omega = 2.0 * PI * cutoff / fs;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let b0 = (1.0 + cos_w) / 2.0;
        Self::normalized(b0, -(1.0 + cos_w), b0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
    }

    /// First-order bilinear low-pass, stored with `b2 == a2 == 0`.
    pub fn lowpass_first_order(fs: f64, cutoff: f64) -> Self {
        let k = (PI * cutoff / fs).tan();
        Self::normalized(k, k, 0.0, 1.0 + k, k - 1.0, 0.0)
    }

    /// First-order bilinear high-pass, stored with `b2 == a2 == 0`.
    pub fn highpass_first_order(fs: f64, cutoff: f64) -> Self {
        let k = (PI * cutoff / fs).tan();
        Self::normalized(1.0, -1.0, 0.0, 1.0 + k, k - 1.0, 0.0)
    }

    /// Gain at 0 Hz.
    pub fn dc_gain(&self) -> f64 {
        let den = 1.0 + self.a1 + self.a2;
        if den.abs() < f64::EPSILON {
            0.0
        } else {
            (self.b0 + self.b1 + self.b2) / den
        }
    }
}

/// Quality factors of the second-order sections of an order-`order`
/// Butterworth prototype.
fn butterworth_qs(order: usize) -> Vec<f64> {
    let n = order as f64;
    (0..order / 2)
        .map(|k| 1.0 / (2.0 * ((2 * k + 1) as f64 * PI / (2.0 * n)).sin()))
        .collect()
}

/// Cascade of second-order sections.
#[derive(Debug, Clone, PartialEq)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

impl SosFilter {
    pub fn new(sections: Vec<Biquad>) -> Self {
        Self { sections }
    }

    pub fn butterworth_highpass(fs: f64, cutoff: f64, order: usize) -> Self {
        let mut sections: Vec<Biquad> = butterworth_qs(order)
            .into_iter()
            .map(|q| Biquad::highpass(fs, cutoff, q))
            .collect();
        if order % 2 == 1 {
            sections.push(Biquad::highpass_first_order(fs, cutoff));
        }
        Self { sections }
    }

    pub fn butterworth_lowpass(fs: f64, cutoff: f64, order: usize) -> Self {
        let mut sections: Vec<Biquad> = butterworth_qs(order)
            .into_iter()
            .map(|q| Biquad::lowpass(fs, cutoff, q))
            .collect();
        if order % 2 == 1 {
            sections.push(Biquad::lowpass_first_order(fs, cutoff));
        }
        Self { sections }
    }

    /// High-pass at `params.lowcut` cascaded with low-pass at `params.highcut`.
    pub fn bandpass(fs: f64, params: &FilterParams) -> Self {
        let mut sections = Self::butterworth_highpass(fs, params.lowcut, params.order).sections;
        sections.extend(Self::butterworth_lowpass(fs, params.highcut, params.order).sections);
        Self { sections }
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Run the cascade once over `samples`, starting from the steady state
    /// reached under a constant input equal to the first sample.
    pub fn filter(&self, samples: &mut [f64]) {
        let Some(&first) = samples.first() else {
            return;
        };
        let mut level = first;
        for c in &self.sections {
            let out_level = level * c.dc_gain();
            // [x1, x2, y1, y2]
            let mut s = [level, level, out_level, out_level];
            for x in samples.iter_mut() {
                let y = c.b0 * *x + c.b1 * s[0] + c.b2 * s[1] - c.a1 * s[2] - c.a2 * s[3];
                s[1] = s[0];
                s[0] = *x;
                s[3] = s[2];
                s[2] = y;
                *x = y;
            }
            level = out_level;
        }
    }

    /// Edge padding used by [`SosFilter::filtfilt`].
    pub fn pad_len(&self) -> usize {
        3 * (2 * self.sections.len() + 1)
    }

    /// Forward-backward filtering with odd extension at both edges.
    pub fn filtfilt(&self, samples: &[f64]) -> Vec<f64> {
        let n = samples.len();
        if n == 0 {
            return Vec::new();
        }
        let pad = self.pad_len().min(n - 1);

        let mut ext = Vec::with_capacity(n + 2 * pad);
        let first = samples[0];
        let last = samples[n - 1];
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - samples[i]));
        ext.extend_from_slice(samples);
        ext.extend((1..=pad).map(|i| 2.0 * last - samples[n - 1 - i]));

        self.filter(&mut ext);
        ext.reverse();
        self.filter(&mut ext);
        ext.reverse();

        ext[pad..pad + n].to_vec()
    }
}

/// Round and saturate to the int16 range.
pub fn saturate_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Band-pass every channel of a frames-by-channels matrix.
pub fn bandpass_filter(data: &Array2<i16>, fs: f64, params: &FilterParams) -> Array2<i16> {
    let filter = SosFilter::bandpass(fs, params);
    let mut out = Array2::<i16>::zeros(data.raw_dim());
    for (ch, column) in data.columns().into_iter().enumerate() {
        let trace: Vec<f64> = column.iter().map(|&v| v as f64).collect();
        let filtered = filter.filtfilt(&trace);
        for (t, value) in filtered.into_iter().enumerate() {
            out[[t, ch]] = saturate_i16(value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn peak(values: &[f64]) -> f64 {
        values.iter().fold(0.0f64, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_butterworth_q_values() {
        let qs = butterworth_qs(4);
        assert_eq!(qs.len(), 2);
        assert!((qs[0] - 1.3066).abs() < 1e-3);
        assert!((qs[1] - 0.5412).abs() < 1e-3);
        assert!((butterworth_qs(2)[0] - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn test_section_counts() {
        let params = FilterParams {
            lowcut: 300.0,
            highcut: 4000.0,
            order: 3,
        };
        // one biquad plus one first-order section per side
        assert_eq!(SosFilter::bandpass(20_000.0, &params).sections().len(), 4);
    }

    #[test]
    fn test_passband_preserved_and_stopband_removed() {
        let fs = 20_000.0;
        let params = FilterParams::default();
        let filter = SosFilter::bandpass(fs, &params);

        let pass = filter.filtfilt(&sine(1000.0, fs, 20_000, 1000.0));
        let pass_peak = peak(&pass[2000..18_000]);
        assert!((pass_peak - 1000.0).abs() < 30.0, "passband peak {pass_peak}");

        let stop = filter.filtfilt(&sine(20.0, fs, 20_000, 1000.0));
        assert!(peak(&stop[2000..18_000]) < 5.0);

        let dc = filter.filtfilt(&vec![500.0; 4000]);
        assert!(peak(&dc) < 1.0);
    }

    #[test]
    fn test_zero_phase() {
        let fs = 20_000.0;
        let filter = SosFilter::bandpass(fs, &FilterParams::default());
        let input = sine(1000.0, fs, 20_000, 1000.0);
        let output = filter.filtfilt(&input);
        // a phase lag would show up as a large residual at the peaks
        let residual = peak(
            &input[2000..18_000]
                .iter()
                .zip(&output[2000..18_000])
                .map(|(a, b)| a - b)
                .collect::<Vec<_>>(),
        );
        assert!(residual < 50.0, "residual {residual}");
    }

    #[test]
    fn test_saturation() {
        assert_eq!(saturate_i16(1e9), i16::MAX);
        assert_eq!(saturate_i16(-1e9), i16::MIN);
        assert_eq!(saturate_i16(2.5), 3);
        assert_eq!(saturate_i16(-2.4), -2);
    }

    #[test]
    fn test_short_inputs() {
        let filter = SosFilter::bandpass(20_000.0, &FilterParams::default());
        assert!(filter.filtfilt(&[]).is_empty());
        assert_eq!(filter.filtfilt(&[3.0]).len(), 1);

        let data = Array2::<i16>::zeros((2, 3));
        assert_eq!(bandpass_filter(&data, 20_000.0, &FilterParams::default()).dim(), (2, 3));
    }
}
