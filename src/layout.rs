//! Workspace directory layout.
//!
//! Every artifact lives at a path that is a pure function of its kind, its
//! epoch block and its segment. The pipeline treats the existence of that
//! path as the only record that the work was done.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.yaml";
pub const COORDS_FILE: &str = "electrode_coords.txt";
pub const REFERENCE_FILE: &str = "reference_segment.txt";
pub const ACQUISITION_DIR: &str = "acquisition";
pub const RAW_DIR: &str = "raw";
pub const COMPUTED_DIR: &str = "computed";
pub const SHIFT_COEFFS_FILE: &str = "shift_coeffs.yaml";
pub const LEDGER_FILE: &str = "run_ledger.json";

/// Sidecar suffix recording when and how fast an artifact was written.
pub const INFO_SUFFIX: &str = ".info";

/// A raw segment: the `number`-th fixed-duration chunk of an epoch block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId {
    pub block: String,
    /// 1-based
    pub number: u32,
}

impl SegmentId {
    pub fn new(block: impl Into<String>, number: u32) -> Self {
        Self {
            block: block.into(),
            number,
        }
    }

    /// `segment_NNN.bin`
    pub fn file_name(&self) -> String {
        format!("segment_{:03}.bin", self.number)
    }

    /// Parse a raw segment file name back into its number.
    pub fn parse_file_name(name: &str) -> Option<u32> {
        let digits = name.strip_prefix("segment_")?.strip_suffix(".bin")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().filter(|n| *n > 0)
    }

    /// Parse a `<block>/<segment file>` designation.
    pub fn parse_designation(text: &str) -> Option<Self> {
        let (block, file) = text.trim().split_once('/')?;
        if block.is_empty() {
            return None;
        }
        Some(Self::new(block, Self::parse_file_name(file)?))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.block, self.file_name())
    }
}

/// Per-segment artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Raw,
    Filtered,
    Shifted,
    Stats,
    HighActivity,
    ReferenceSorting,
    SpikeSorting,
    SegmentPreview,
}

impl ArtifactKind {
    pub fn name(&self) -> &'static str {
        match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Filtered => "filt",
            ArtifactKind::Shifted => "shifted",
            ArtifactKind::Stats => "stats",
            ArtifactKind::HighActivity => "high_activity",
            ArtifactKind::ReferenceSorting => "reference_sorting",
            ArtifactKind::SpikeSorting => "spike_sorting",
            ArtifactKind::SegmentPreview => "preview",
        }
    }
}

/// Handle on a workspace root directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn coords_path(&self) -> PathBuf {
        self.root.join(COORDS_FILE)
    }

    pub fn reference_path(&self) -> PathBuf {
        self.root.join(REFERENCE_FILE)
    }

    pub fn acquisition_dir(&self) -> PathBuf {
        self.root.join(ACQUISITION_DIR)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join(RAW_DIR)
    }

    pub fn computed_dir(&self) -> PathBuf {
        self.root.join(COMPUTED_DIR)
    }

    pub fn block_raw_dir(&self, block: &str) -> PathBuf {
        self.raw_dir().join(block)
    }

    pub fn shift_coeffs_path(&self) -> PathBuf {
        self.computed_dir().join(SHIFT_COEFFS_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.computed_dir().join(LEDGER_FILE)
    }

    /// Location of a per-segment artifact.
    pub fn artifact_path(&self, kind: ArtifactKind, segment: &SegmentId) -> PathBuf {
        let file = segment.file_name();
        let name = match kind {
            ArtifactKind::Raw => return self.block_raw_dir(&segment.block).join(file),
            ArtifactKind::Filtered => format!("{file}.filt"),
            ArtifactKind::Shifted => format!("{file}.filt.shifted"),
            ArtifactKind::Stats => format!("{file}.stats.json"),
            ArtifactKind::HighActivity => format!("{file}.high_activity.json"),
            ArtifactKind::ReferenceSorting | ArtifactKind::SpikeSorting => file,
            ArtifactKind::SegmentPreview => format!("{file}.preview.json"),
        };
        self.computed_dir()
            .join(kind.name())
            .join(&segment.block)
            .join(name)
    }

    /// Directory holding the aggregated sorting of a whole epoch block.
    pub fn epoch_sorting_dir(&self, block: &str) -> PathBuf {
        self.computed_dir()
            .join("epoch_block_spike_sorting")
            .join(block)
    }

    pub fn epoch_preview_path(&self, block: &str) -> PathBuf {
        self.computed_dir()
            .join("epoch_block_preview")
            .join(block)
            .join("epoch_block.preview.json")
    }

    /// Create the top-level directories of a fresh workspace.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.acquisition_dir(), self.raw_dir(), self.computed_dir()] {
            std::fs::create_dir_all(&dir).map_err(PipelineError::io(&dir))?;
        }
        Ok(())
    }

    /// Names of materialized epoch blocks, sorted.
    pub fn raw_blocks(&self) -> Result<Vec<String>> {
        list_dirs(&self.raw_dir())
    }

    /// Names of acquisition batches, sorted.
    pub fn acquisition_blocks(&self) -> Result<Vec<String>> {
        list_dirs(&self.acquisition_dir())
    }

    /// Raw segments of a block in ascending segment order.
    pub fn raw_segments(&self, block: &str) -> Result<Vec<SegmentId>> {
        let dir = self.block_raw_dir(block);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(PipelineError::io(&dir))? {
            let entry = entry.map_err(PipelineError::io(&dir))?;
            if let Some(number) = entry.file_name().to_str().and_then(SegmentId::parse_file_name)
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers
            .into_iter()
            .map(|n| SegmentId::new(block, n))
            .collect())
    }

    /// Read the reference designation. Absent or empty file means no
    /// reference has been chosen yet.
    pub fn read_reference(&self) -> Result<Option<SegmentId>> {
        let path = self.reference_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(PipelineError::io(&path))?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        SegmentId::parse_designation(text).map(Some).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "{} must name a segment as <block>/segment_NNN.bin, got {text:?}",
                REFERENCE_FILE
            ))
        })
    }

    /// Designate the reference segment.
    pub fn write_reference(&self, segment: &SegmentId) -> Result<()> {
        crate::storage::write_atomic(&self.reference_path(), segment.to_string().as_bytes())
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(PipelineError::io(dir))? {
        let entry = entry.map_err(PipelineError::io(dir))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // staging directories are hidden
        if name.starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
