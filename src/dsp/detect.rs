//! Threshold crossing detection of negative-going spikes.

/// Frames at which `trace` has a spike.
///
/// A frame is a spike when its value is at or below `threshold` and it is
/// the minimum of the surrounding `±window` frames. Of equal minima the
/// earliest is kept. Accepted spikes are at least `window + 1` frames apart.
pub fn detect_spikes(trace: &[f64], threshold: f64, window: usize) -> Vec<usize> {
    let n = trace.len();
    let mut spikes: Vec<usize> = Vec::new();

    for t in 0..n {
        let value = trace[t];
        if value > threshold {
            continue;
        }
        let lo = t.saturating_sub(window);
        let hi = (t + window + 1).min(n);
        let earlier_not_lower = trace[lo..t].iter().all(|&v| v > value);
        let later_not_lower = trace[t + 1..hi].iter().all(|&v| v >= value);
        if !(earlier_not_lower && later_not_lower) {
            continue;
        }
        if let Some(&last) = spikes.last() {
            if t - last <= window {
                continue;
            }
        }
        spikes.push(t);
    }

    spikes
}
