//! Nearest-neighbour label transfer.

use crate::error::{PipelineError, Result};
use ndarray::{ArrayView1, ArrayView2};
use std::collections::BTreeMap;

fn squared_distance(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum()
}

/// Indices of the `k` reference rows closest to `query`, nearest first.
/// Equal distances keep the lower reference index.
pub fn nearest_neighbors(
    query: ArrayView1<'_, f32>,
    reference: ArrayView2<'_, f32>,
    k: usize,
) -> Vec<usize> {
    let mut scored: Vec<(f64, usize)> = reference
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| (squared_distance(query, row), i))
        .collect();
    let k = k.min(scored.len());
    let by_distance = |a: &(f64, usize), b: &(f64, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
    if k < scored.len() {
        scored.select_nth_unstable_by(k, by_distance);
        scored.truncate(k);
    }
    scored.sort_by(by_distance);
    scored.into_iter().map(|(_, i)| i).collect()
}

/// Most frequent label; ties go to the smallest label.
pub fn majority_label(labels: impl IntoIterator<Item = i32>) -> Option<i32> {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    let mut best: Option<(i32, usize)> = None;
    for (label, count) in counts {
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label)
}

/// Label each query row by majority vote over its `k` nearest reference
/// rows, with `k` capped at the reference size.
pub fn classify(
    query: ArrayView2<'_, f32>,
    reference: ArrayView2<'_, f32>,
    reference_labels: &[i32],
    k: usize,
) -> Result<Vec<i32>> {
    if query.nrows() == 0 {
        return Ok(Vec::new());
    }
    if reference.nrows() == 0 {
        return Err(PipelineError::EmptyReferenceCatalog {
            queries: query.nrows(),
        });
    }
    debug_assert_eq!(reference.nrows(), reference_labels.len());
    let k = k.max(1).min(reference.nrows());

    let labels = query
        .rows()
        .into_iter()
        .map(|row| {
            let neighbors = nearest_neighbors(row, reference, k);
            // k >= 1 and the reference is non-empty, so a vote exists
            majority_label(neighbors.into_iter().map(|i| reference_labels[i])).unwrap_or_default()
        })
        .collect();
    Ok(labels)
}
