//! Pairwise cluster separation along template discriminants.

use crate::sorting::matching::nearest_neighbors;
use crate::sorting::Sorting;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Number of template-space neighbours compared with each unit.
pub const SEPARATION_NEIGHBORS: usize = 10;

/// Projections of two units' spikes onto the axis joining their templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationItem {
    pub unit_id_1: i32,
    pub unit_id_2: i32,
    pub projections_1: Vec<f32>,
    pub projections_2: Vec<f32>,
}

/// Build separation items for each unit and its `k` nearest units.
///
/// Spike waveforms are read from `shifted` at each spike's frame. Unordered
/// pairs are visited once; pairs where either unit has fewer than two spikes
/// or whose templates coincide are skipped.
pub fn cluster_separation(
    sorting: &Sorting,
    shifted: &Array2<i16>,
    fs: f64,
    k: usize,
) -> Vec<SeparationItem> {
    let units = sorting.unique_labels();
    let templates = &sorting.templates;
    if units.len() < 2 || templates.nrows() != units.len() {
        return Vec::new();
    }

    let mut seen: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut items = Vec::new();
    for row in 0..units.len() {
        let neighbors = nearest_neighbors(templates.row(row), templates.view(), k + 1);
        for other in neighbors.into_iter().filter(|&o| o != row).take(k) {
            if !seen.insert((row.min(other), row.max(other))) {
                continue;
            }

            let frames_1 = spike_frames(sorting, units[row], shifted.nrows(), fs);
            let frames_2 = spike_frames(sorting, units[other], shifted.nrows(), fs);
            if frames_1.len() < 2 || frames_2.len() < 2 {
                continue;
            }

            let diff: Array1<f64> = templates
                .row(other)
                .iter()
                .zip(templates.row(row).iter())
                .map(|(&b, &a)| b as f64 - a as f64)
                .collect();
            let norm = diff.dot(&diff).sqrt();
            if norm <= 0.0 {
                continue;
            }
            let axis = diff / norm;

            items.push(SeparationItem {
                unit_id_1: units[row],
                unit_id_2: units[other],
                projections_1: project(shifted, &frames_1, &axis),
                projections_2: project(shifted, &frames_2, &axis),
            });
        }
    }
    items
}

fn spike_frames(sorting: &Sorting, unit: i32, n_frames: usize, fs: f64) -> Vec<usize> {
    sorting
        .spike_train(unit)
        .into_iter()
        .map(|t| (t * fs).round())
        .filter(|&f| f >= 0.0 && (f as usize) < n_frames)
        .map(|f| f as usize)
        .collect()
}

fn project(shifted: &Array2<i16>, frames: &[usize], axis: &Array1<f64>) -> Vec<f32> {
    frames
        .iter()
        .map(|&f| {
            shifted
                .row(f)
                .iter()
                .zip(axis.iter())
                .map(|(&v, &a)| v as f64 * a)
                .sum::<f64>() as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn fixture() -> (Sorting, Array2<i16>) {
        let mut shifted = Array2::<i16>::zeros((100, 2));
        for &t in &[10, 20, 30] {
            shifted[[t, 0]] = -50;
        }
        for &t in &[40, 50] {
            shifted[[t, 1]] = -80;
        }
        shifted[[60, 1]] = -10;
        let sorting = Sorting {
            templates: array![[-50.0, 0.0], [0.0, -80.0], [0.0, -10.0]],
            spike_times: array![0.01, 0.02, 0.03, 0.04, 0.05, 0.06],
            spike_labels: array![2, 2, 2, 5, 5, 9],
            spike_amplitudes: array![50.0, 50.0, 50.0, 80.0, 80.0, 10.0],
        };
        (sorting, shifted)
    }

    #[test]
    fn test_pairs_are_deduplicated_and_small_units_skipped() {
        let (sorting, shifted) = fixture();
        let items = cluster_separation(&sorting, &shifted, 1000.0, SEPARATION_NEIGHBORS);
        // unit 9 has a single spike, so only (2, 5) survives
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!((item.unit_id_1, item.unit_id_2), (2, 5));
        assert_eq!(item.projections_1.len(), 3);
        assert_eq!(item.projections_2.len(), 2);
        // unit 5 projects further along the axis pointing from 2 to 5
        assert!(item.projections_2[0] > item.projections_1[0]);
    }

    #[test]
    fn test_coincident_templates_skipped() {
        let (mut sorting, shifted) = fixture();
        sorting.templates = array![[-1.0, 0.0], [-1.0, 0.0], [0.0, -10.0]];
        let items = cluster_separation(&sorting, &shifted, 1000.0, SEPARATION_NEIGHBORS);
        assert!(items.is_empty());
    }

    #[test]
    fn test_single_unit_has_no_pairs() {
        let sorting = Sorting {
            templates: array![[-1.0f32]],
            spike_times: array![0.0, 0.1],
            spike_labels: array![1, 1],
            spike_amplitudes: array![1.0, 1.0],
        };
        let shifted = Array2::<i16>::zeros((200, 1));
        assert!(cluster_separation(&sorting, &shifted, 1000.0, 10).is_empty());
    }
}
