//! Spike sorting against a reference catalog.
//!
//! The reference segment is clustered once; every other segment's spikes are
//! then labelled by nearest-neighbour vote against the reference spikes, so
//! all segments share the reference's unit label space.

pub mod clustering;
pub mod engine;
pub mod matching;
pub mod templates;

pub use clustering::cluster_frames;
pub use engine::{classify_segment, extract_spikes, reference_sort, ReferenceCatalog, SpikeFrames};
pub use matching::classify;
pub use templates::{canonicalize, median_templates, peak_channels};

use crate::error::{PipelineError, Result};
use crate::storage;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_npy::{read_npy, write_npy};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

pub const TEMPLATES_FILE: &str = "templates.npy";
pub const SPIKE_TIMES_FILE: &str = "spike_times.npy";
pub const SPIKE_LABELS_FILE: &str = "spike_labels.npy";
pub const SPIKE_AMPLITUDES_FILE: &str = "spike_amplitudes.npy";

/// Files that make up a sorting bundle.
pub const SORTING_FILES: [&str; 4] = [
    TEMPLATES_FILE,
    SPIKE_TIMES_FILE,
    SPIKE_LABELS_FILE,
    SPIKE_AMPLITUDES_FILE,
];

/// Labelled spikes of one segment or epoch block.
///
/// Row `j` of `templates` belongs to the `j`-th smallest label present in
/// `spike_labels`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sorting {
    /// Units by channels
    pub templates: Array2<f32>,
    /// Seconds from the start of the segment (or epoch block)
    pub spike_times: Array1<f32>,
    pub spike_labels: Array1<i32>,
    /// Negated trough value of each spike
    pub spike_amplitudes: Array1<f32>,
}

impl Sorting {
    /// A sorting without spikes.
    pub fn empty(n_channels: usize) -> Self {
        Self {
            templates: Array2::zeros((0, n_channels)),
            spike_times: Array1::zeros(0),
            spike_labels: Array1::zeros(0),
            spike_amplitudes: Array1::zeros(0),
        }
    }

    pub fn num_spikes(&self) -> usize {
        self.spike_times.len()
    }

    pub fn num_units(&self) -> usize {
        self.templates.nrows()
    }

    pub fn num_channels(&self) -> usize {
        self.templates.ncols()
    }

    /// Distinct labels in ascending order.
    pub fn unique_labels(&self) -> Vec<i32> {
        let mut labels = self.spike_labels.to_vec();
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// Spike count per label.
    pub fn spike_counts(&self) -> BTreeMap<i32, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.spike_labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }

    /// Template row of `label`, if the label occurs.
    pub fn template_for(&self, label: i32) -> Option<ArrayView1<'_, f32>> {
        let row = self.unique_labels().binary_search(&label).ok()?;
        (row < self.templates.nrows()).then(|| self.templates.row(row))
    }

    /// Spike times of one unit, in the stored order.
    pub fn spike_train(&self, label: i32) -> Vec<f64> {
        self.spike_labels
            .iter()
            .zip(&self.spike_times)
            .filter(|(l, _)| **l == label)
            .map(|(_, &t)| t as f64)
            .collect()
    }

    fn check_shapes(&self, dir: &Path) -> Result<()> {
        let n = self.spike_times.len();
        if self.spike_labels.len() != n || self.spike_amplitudes.len() != n {
            return Err(PipelineError::malformed(
                dir,
                "spike arrays differ in length",
            ));
        }
        let units = self.unique_labels().len();
        if self.templates.nrows() != units {
            return Err(PipelineError::malformed(
                dir,
                format!(
                    "{} templates for {units} distinct labels",
                    self.templates.nrows()
                ),
            ));
        }
        Ok(())
    }

    /// Whether all four bundle files exist in `dir`.
    pub fn is_complete(dir: &Path) -> bool {
        SORTING_FILES.iter().all(|f| dir.join(f).is_file())
    }

    /// Write the bundle to `dir` through a staging directory.
    pub fn write(&self, dir: &Path) -> Result<()> {
        self.check_shapes(dir)?;
        let started = Instant::now();
        let staged = storage::staging_path(dir);
        std::fs::create_dir_all(&staged).map_err(PipelineError::io(&staged))?;

        let written = (|| -> Result<()> {
            write_npy(staged.join(TEMPLATES_FILE), &self.templates)?;
            write_npy(staged.join(SPIKE_TIMES_FILE), &self.spike_times)?;
            write_npy(staged.join(SPIKE_LABELS_FILE), &self.spike_labels)?;
            write_npy(staged.join(SPIKE_AMPLITUDES_FILE), &self.spike_amplitudes)?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = std::fs::remove_dir_all(&staged);
            return Err(e);
        }

        // an incomplete leftover directory blocks the rename
        if dir.exists() && !Self::is_complete(dir) {
            std::fs::remove_dir_all(dir).map_err(PipelineError::io(dir))?;
        }
        storage::write_info(dir, started)?;
        storage::commit(&staged, dir)
    }

    /// Read a bundle written by [`Sorting::write`].
    pub fn read(dir: &Path) -> Result<Self> {
        let sorting = Self {
            templates: read_npy(dir.join(TEMPLATES_FILE))?,
            spike_times: read_npy(dir.join(SPIKE_TIMES_FILE))?,
            spike_labels: read_npy(dir.join(SPIKE_LABELS_FILE))?,
            spike_amplitudes: read_npy(dir.join(SPIKE_AMPLITUDES_FILE))?,
        };
        sorting.check_shapes(dir)?;
        Ok(sorting)
    }
}
