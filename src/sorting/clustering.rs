//! Clustering of reference spike waveforms.
//!
//! Clusters are seeded by farthest-point selection, refined with Lloyd
//! iterations and then merged pairwise while two neighbouring clusters are
//! not separated along the axis joining their centroids. Every step is
//! deterministic: ties always resolve to the lower index.

use crate::config::SortingParams;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::collections::BTreeMap;
use tracing::debug;

/// Lloyd iterations before giving up on convergence.
pub const MAX_KMEANS_ITERATIONS: usize = 30;

/// Each cluster is only compared with this many nearest centroids when
/// looking for merges.
pub const MERGE_NEIGHBORS: usize = 20;

/// Clusters smaller than this are folded into their nearest neighbour
/// before merging.
pub const MIN_CLUSTER_SIZE: usize = 5;

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x - y as f64;
            d * d
        })
        .sum()
}

/// Seed indices by repeatedly taking the frame farthest from all seeds so
/// far, stopping at `max_clusters` or once every frame coincides with a seed.
fn farthest_point_seeds(frames: ArrayView2<'_, f32>, max_clusters: usize) -> Vec<usize> {
    let n = frames.nrows();
    if n == 0 || max_clusters == 0 {
        return Vec::new();
    }
    let mut seeds = vec![0];
    let first = frames.row(0).mapv(|v| v as f64);
    let mut min_dist: Vec<f64> = frames
        .rows()
        .into_iter()
        .map(|r| squared_distance(first.view(), r))
        .collect();

    while seeds.len() < max_clusters {
        let (next, &far) = min_dist
            .iter()
            .enumerate()
            .fold((0, &f64::NEG_INFINITY), |best, (i, d)| if *d > *best.1 { (i, d) } else { best });
        if far <= 0.0 {
            break;
        }
        seeds.push(next);
        let seed = frames.row(next).mapv(|v| v as f64);
        for (i, row) in frames.rows().into_iter().enumerate() {
            let d = squared_distance(seed.view(), row);
            if d < min_dist[i] {
                min_dist[i] = d;
            }
        }
    }
    seeds
}

fn nearest_centroid(centroids: &Array2<f64>, row: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (k, c) in centroids.rows().into_iter().enumerate() {
        let d = squared_distance(c, row);
        if d < best_d {
            best_d = d;
            best = k;
        }
    }
    best
}

fn centroid_of(frames: ArrayView2<'_, f32>, members: &[usize]) -> Array1<f64> {
    let mut sum = Array1::<f64>::zeros(frames.ncols());
    for &i in members {
        sum.zip_mut_with(&frames.row(i), |s, &v| *s += v as f64);
    }
    if !members.is_empty() {
        sum /= members.len() as f64;
    }
    sum
}

fn kmeans(frames: ArrayView2<'_, f32>, seeds: &[usize]) -> Vec<usize> {
    let mut centroids = Array2::<f64>::zeros((seeds.len(), frames.ncols()));
    for (k, &s) in seeds.iter().enumerate() {
        centroids
            .row_mut(k)
            .assign(&frames.row(s).mapv(|v| v as f64));
    }

    let mut assignment: Vec<usize> = frames
        .rows()
        .into_iter()
        .map(|r| nearest_centroid(&centroids, r))
        .collect();

    for iteration in 0..MAX_KMEANS_ITERATIONS {
        for k in 0..seeds.len() {
            let members: Vec<usize> = (0..assignment.len()).filter(|&i| assignment[i] == k).collect();
            // an emptied cluster keeps its last centroid
            if !members.is_empty() {
                centroids.row_mut(k).assign(&centroid_of(frames, &members));
            }
        }
        let next: Vec<usize> = frames
            .rows()
            .into_iter()
            .map(|r| nearest_centroid(&centroids, r))
            .collect();
        if next == assignment {
            debug!(iterations = iteration + 1, "k-means converged");
            break;
        }
        assignment = next;
    }
    assignment
}

/// Separation of two clusters along the axis joining their centroids:
/// distance between the projected means over the pooled standard deviation.
/// Returns infinity when both clusters are tight and apart.
pub fn separation_index(frames: ArrayView2<'_, f32>, a: &[usize], b: &[usize]) -> f64 {
    let ca = centroid_of(frames, a);
    let cb = centroid_of(frames, b);
    let axis = &ca - &cb;
    let norm = axis.dot(&axis).sqrt();
    if norm == 0.0 {
        return 0.0;
    }
    let axis = axis / norm;

    let project = |members: &[usize]| -> (f64, f64) {
        let values: Vec<f64> = members
            .iter()
            .map(|&i| {
                frames
                    .row(i)
                    .iter()
                    .zip(axis.iter())
                    .map(|(&v, &w)| v as f64 * w)
                    .sum()
            })
            .collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        (mean, var)
    };
    let (mean_a, var_a) = project(a);
    let (mean_b, var_b) = project(b);
    let pooled = ((var_a + var_b) / 2.0).sqrt();
    if pooled == 0.0 {
        return f64::INFINITY;
    }
    (mean_a - mean_b).abs() / pooled
}

/// Candidate merge pairs: every cluster with its nearest centroids.
fn candidate_pairs(frames: ArrayView2<'_, f32>, clusters: &BTreeMap<usize, Vec<usize>>) -> Vec<(usize, usize)> {
    let centroids: Vec<(usize, Array1<f64>)> = clusters
        .iter()
        .map(|(&id, members)| (id, centroid_of(frames, members)))
        .collect();

    let mut pairs = Vec::new();
    for (id, c) in &centroids {
        let mut others: Vec<(f64, usize)> = centroids
            .iter()
            .filter(|(other, _)| other != id)
            .map(|(other, oc)| {
                let d = c - oc;
                (d.dot(&d), *other)
            })
            .collect();
        others.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)));
        for (_, other) in others.into_iter().take(MERGE_NEIGHBORS) {
            pairs.push((*id.min(&other), *id.max(&other)));
        }
    }
    pairs.sort_unstable();
    pairs.dedup();
    pairs
}

fn absorb_small_clusters(frames: ArrayView2<'_, f32>, clusters: &mut BTreeMap<usize, Vec<usize>>) {
    while clusters.len() > 1 {
        let Some((&small, _)) = clusters
            .iter()
            .filter(|(_, m)| m.len() < MIN_CLUSTER_SIZE)
            .min_by_key(|(id, m)| (m.len(), **id))
        else {
            break;
        };
        let moved = clusters.remove(&small).unwrap_or_default();
        let centroid = centroid_of(frames, &moved);
        let mut target = None;
        let mut target_d = f64::INFINITY;
        for (&id, members) in clusters.iter() {
            let c = centroid_of(frames, members);
            let d = &c - &centroid;
            let d = d.dot(&d);
            if d < target_d {
                target_d = d;
                target = Some(id);
            }
        }
        if let Some(members) = target.and_then(|id| clusters.get_mut(&id)) {
            members.extend(moved);
            members.sort_unstable();
        }
    }
}

fn merge_clusters(frames: ArrayView2<'_, f32>, clusters: &mut BTreeMap<usize, Vec<usize>>, threshold: f64) {
    let mut cache: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    loop {
        let mut best: Option<((usize, usize), f64)> = None;
        for pair in candidate_pairs(frames, clusters) {
            let score = *cache
                .entry(pair)
                .or_insert_with(|| separation_index(frames, &clusters[&pair.0], &clusters[&pair.1]));
            if best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some((pair, score));
            }
        }
        let Some(((keep, absorb), score)) = best else {
            break;
        };
        if score >= threshold {
            break;
        }
        debug!(keep, absorb, score, "merging clusters");
        let moved = clusters.remove(&absorb).unwrap_or_default();
        if let Some(members) = clusters.get_mut(&keep) {
            members.extend(moved);
            members.sort_unstable();
        }
        cache.retain(|&(a, b), _| a != keep && b != keep && a != absorb && b != absorb);
    }
}

/// Cluster frames into units labelled `1..=K`.
///
/// Labels follow the order of each cluster's earliest member, so the first
/// frame always belongs to unit 1.
pub fn cluster_frames(frames: ArrayView2<'_, f32>, params: &SortingParams) -> Vec<i32> {
    let n = frames.nrows();
    if n == 0 {
        return Vec::new();
    }

    let seeds = farthest_point_seeds(frames, params.max_clusters);
    let assignment = kmeans(frames, &seeds);

    let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &k) in assignment.iter().enumerate() {
        clusters.entry(k).or_default().push(i);
    }
    let initial = clusters.len();
    absorb_small_clusters(frames, &mut clusters);
    merge_clusters(frames, &mut clusters, params.merge_separation);
    debug!(initial, merged = clusters.len(), "clustering finished");

    let mut by_first: Vec<&Vec<usize>> = clusters.values().collect();
    by_first.sort_by_key(|members| members[0]);

    let mut labels = vec![0i32; n];
    for (k, members) in by_first.into_iter().enumerate() {
        for &i in members {
            labels[i] = k as i32 + 1;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn params() -> SortingParams {
        SortingParams::default()
    }

    #[test]
    fn test_identical_frames_form_one_cluster() {
        let frames = Array2::<f32>::from_elem((5, 3), -7.0);
        assert_eq!(cluster_frames(frames.view(), &params()), vec![1; 5]);
    }

    #[test]
    fn test_two_distinct_waveforms() {
        let a = [-200.0f32, -50.0, 0.0, 0.0];
        let b = [0.0f32, 0.0, -60.0, -180.0];
        let mut frames = Array2::<f32>::zeros((10, 4));
        for i in 0..10 {
            let src = if i % 2 == 0 { &a } else { &b };
            frames.row_mut(i).assign(&ArrayView1::from(&src[..]));
        }
        let labels = cluster_frames(frames.view(), &params());
        assert_eq!(labels, vec![1, 2, 1, 2, 1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn test_overlapping_clusters_are_merged() {
        let frames = array![[0.0f32], [2.0], [4.0], [6.0], [5.0], [7.0], [9.0], [11.0], [100.0], [101.0]];
        let mut clusters = BTreeMap::new();
        clusters.insert(0, vec![0, 1, 2, 3]);
        clusters.insert(1, vec![4, 5, 6, 7]);
        clusters.insert(2, vec![8, 9]);
        merge_clusters(frames.view(), &mut clusters, 3.0);

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[&0], vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(clusters[&2], vec![8, 9]);
    }

    #[test]
    fn test_small_clusters_are_absorbed() {
        let frames = array![[0.0f32], [1.0], [2.0], [3.0], [4.0], [5.0], [50.0]];
        let mut clusters = BTreeMap::new();
        clusters.insert(0, vec![0, 1, 2, 3, 4, 5]);
        clusters.insert(1, vec![6]);
        absorb_small_clusters(frames.view(), &mut clusters);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[&0].len(), 7);
    }

    #[test]
    fn test_separation_index() {
        let frames = array![[0.0f32], [1.0], [10.0], [11.0]];
        let sep = separation_index(frames.view(), &[0, 1], &[2, 3]);
        assert!((sep - 20.0).abs() < 1e-9);
        assert_eq!(separation_index(frames.view(), &[0], &[2]), f64::INFINITY);
    }

    #[test]
    fn test_empty_input() {
        let frames = Array2::<f32>::zeros((0, 4));
        assert!(cluster_frames(frames.view(), &params()).is_empty());
    }
}
