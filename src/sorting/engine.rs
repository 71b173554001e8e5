//! Segment-level sorting operations.

use crate::config::{ElectrodeCoords, SortingParams};
use crate::dsp::activity::Interval;
use crate::dsp::detect::detect_spikes;
use crate::error::Result;
use crate::sorting::clustering::cluster_frames;
use crate::sorting::matching::classify;
use crate::sorting::templates::{canonicalize, median_templates};
use crate::sorting::Sorting;
use ndarray::{Array1, Array2};
use tracing::debug;

/// Detected spikes of a segment and their cross-channel waveforms.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeFrames {
    /// Frame index of each spike trough
    pub indices: Vec<usize>,
    /// Spikes by channels
    pub frames: Array2<f32>,
}

impl SpikeFrames {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Detect spikes on the per-frame minimum across channels, with the
/// high-activity intervals blanked, and take the frame at each spike.
pub fn extract_spikes(
    shifted: &Array2<i16>,
    high_activity: &[Interval],
    fs: f64,
    threshold: f64,
    window: usize,
) -> SpikeFrames {
    let n_frames = shifted.nrows();
    let mut quiet = vec![true; n_frames];
    for interval in high_activity {
        let (start, end) = interval.frame_range(fs, n_frames);
        for flag in quiet.iter_mut().take(end).skip(start) {
            *flag = false;
        }
    }

    let min_trace: Vec<f64> = shifted
        .rows()
        .into_iter()
        .zip(&quiet)
        .map(|(row, &keep)| {
            if keep {
                row.iter().copied().min().map(|v| v as f64).unwrap_or(0.0)
            } else {
                0.0
            }
        })
        .collect();

    let indices = detect_spikes(&min_trace, threshold, window);
    let mut frames = Array2::<f32>::zeros((indices.len(), shifted.ncols()));
    for (row, &t) in indices.iter().enumerate() {
        frames
            .row_mut(row)
            .assign(&shifted.row(t).mapv(|v| v as f32));
    }
    SpikeFrames { indices, frames }
}

/// Assemble a sorting from labelled spikes: amplitudes, median templates
/// and canonical numbering.
fn build_sorting(
    spikes: &SpikeFrames,
    mut labels: Vec<i32>,
    fs: f64,
    coords: &ElectrodeCoords,
) -> Sorting {
    let n_channels = spikes.frames.ncols();
    if spikes.is_empty() {
        return Sorting::empty(n_channels);
    }

    let amplitudes: Array1<f32> = spikes
        .frames
        .rows()
        .into_iter()
        .map(|row| -row.iter().copied().fold(f32::INFINITY, f32::min))
        .collect();

    let (_, templates) = median_templates(spikes.frames.view(), &labels);
    let templates = canonicalize(&templates, &mut labels, coords);

    Sorting {
        templates,
        spike_times: spikes
            .indices
            .iter()
            .map(|&t| (t as f64 / fs) as f32)
            .collect(),
        spike_labels: Array1::from(labels),
        spike_amplitudes: amplitudes,
    }
}

/// Cluster the reference segment's spikes into units.
pub fn reference_sort(
    shifted: &Array2<i16>,
    high_activity: &[Interval],
    fs: f64,
    coords: &ElectrodeCoords,
    threshold: f64,
    params: &SortingParams,
) -> Sorting {
    let spikes = extract_spikes(shifted, high_activity, fs, threshold, params.refractory_frames);
    let labels = cluster_frames(spikes.frames.view(), params);
    let sorting = build_sorting(&spikes, labels, fs, coords);
    debug!(
        spikes = sorting.num_spikes(),
        units = sorting.num_units(),
        "reference clustering done"
    );
    sorting
}

/// Labelled reference spikes used as ground truth for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCatalog {
    pub frames: Array2<f32>,
    pub labels: Vec<i32>,
}

impl ReferenceCatalog {
    /// Recover the reference spike waveforms from the reference segment's
    /// shifted data. Spike times are mapped back to the nearest frame.
    pub fn from_sorting(sorting: &Sorting, shifted: &Array2<i16>, fs: f64) -> Self {
        let n_frames = shifted.nrows();
        let mut frames = Array2::<f32>::zeros((sorting.num_spikes(), shifted.ncols()));
        if n_frames > 0 {
            for (row, &t) in sorting.spike_times.iter().enumerate() {
                let index = ((t as f64 * fs).round().max(0.0) as usize).min(n_frames - 1);
                frames
                    .row_mut(row)
                    .assign(&shifted.row(index).mapv(|v| v as f32));
            }
        }
        Self {
            frames,
            labels: sorting.spike_labels.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Sort a segment by transferring reference labels to its spikes.
///
/// A segment without spikes yields an empty sorting even when the catalog is
/// empty; spikes with an empty catalog are an error.
pub fn classify_segment(
    shifted: &Array2<i16>,
    high_activity: &[Interval],
    fs: f64,
    coords: &ElectrodeCoords,
    threshold: f64,
    params: &SortingParams,
    catalog: &ReferenceCatalog,
) -> Result<Sorting> {
    let spikes = extract_spikes(shifted, high_activity, fs, threshold, params.refractory_frames);
    let labels = classify(
        spikes.frames.view(),
        catalog.frames.view(),
        &catalog.labels,
        params.num_neighbors,
    )?;
    Ok(build_sorting(&spikes, labels, fs, coords))
}
