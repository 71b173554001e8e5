//! Unit templates and canonical unit numbering.

use crate::config::ElectrodeCoords;
use ndarray::{Array2, ArrayView2};
use statrs::statistics::{Data, Median};
use std::collections::BTreeMap;

/// Per-label median waveform.
///
/// Returns the labels in ascending order together with a matrix whose row
/// `j` is the channel-wise median of the frames carrying the `j`-th label.
pub fn median_templates(frames: ArrayView2<'_, f32>, labels: &[i32]) -> (Vec<i32>, Array2<f32>) {
    let n_channels = frames.ncols();
    let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        members.entry(label).or_default().push(i);
    }

    let mut templates = Array2::<f32>::zeros((members.len(), n_channels));
    for (row, rows) in members.values().enumerate() {
        for ch in 0..n_channels {
            let values: Vec<f64> = rows.iter().map(|&i| frames[[i, ch]] as f64).collect();
            templates[[row, ch]] = Data::new(values).median() as f32;
        }
    }
    (members.into_keys().collect(), templates)
}

/// Channel holding the most negative value of each template; the lowest
/// channel wins ties.
pub fn peak_channels(templates: ArrayView2<'_, f32>) -> Vec<usize> {
    templates
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (ch, &v) in row.iter().enumerate() {
                if v < row[best] {
                    best = ch;
                }
            }
            best
        })
        .collect()
}

/// Renumber units so that templates appear in order of their peak channel's
/// x coordinate.
///
/// `templates` rows follow the ascending distinct values of `labels`. The
/// label set is unchanged: the unit whose template sorts `j`-th receives the
/// `j`-th smallest label, and its template moves to row `j`. Equal
/// coordinates keep their previous order, so applying this twice is the
/// same as applying it once.
pub fn canonicalize(
    templates: &Array2<f32>,
    labels: &mut [i32],
    coords: &ElectrodeCoords,
) -> Array2<f32> {
    let mut sorted_labels: Vec<i32> = labels.to_vec();
    sorted_labels.sort_unstable();
    sorted_labels.dedup();
    if sorted_labels.is_empty() {
        return templates.clone();
    }

    let peak_x: Vec<f64> = peak_channels(templates.view())
        .into_iter()
        .map(|ch| coords.x(ch))
        .collect();
    let mut order: Vec<usize> = (0..peak_x.len()).collect();
    order.sort_by(|&a, &b| peak_x[a].total_cmp(&peak_x[b]));

    let mut remap: BTreeMap<i32, i32> = BTreeMap::new();
    let mut out = Array2::<f32>::zeros(templates.raw_dim());
    for (new_row, &old_row) in order.iter().enumerate() {
        out.row_mut(new_row).assign(&templates.row(old_row));
        remap.insert(sorted_labels[old_row], sorted_labels[new_row]);
    }
    for label in labels.iter_mut() {
        if let Some(&new) = remap.get(label) {
            *label = new;
        }
    }
    out
}
