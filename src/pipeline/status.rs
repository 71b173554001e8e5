//! Completion state of the workspace, derived from artifact existence.

use crate::error::Result;
use crate::layout::{ArtifactKind, SegmentId, Workspace};
use crate::sorting::Sorting;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Complete,
}

impl ArtifactStatus {
    fn of_file(path: &Path) -> Self {
        if path.is_file() {
            Self::Complete
        } else {
            Self::Pending
        }
    }

    fn of_sorting(dir: &Path) -> Self {
        if Sorting::is_complete(dir) {
            Self::Complete
        } else {
            Self::Pending
        }
    }

    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }
}

/// Derived artifacts of one raw segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStatus {
    pub id: SegmentId,
    pub filtered: ArtifactStatus,
    pub shifted: ArtifactStatus,
    pub stats: ArtifactStatus,
    pub high_activity: ArtifactStatus,
    pub reference_sorting: ArtifactStatus,
    pub spike_sorting: ArtifactStatus,
    pub preview: ArtifactStatus,
}

impl SegmentStatus {
    pub fn capture(workspace: &Workspace, id: SegmentId) -> Self {
        let file = |kind| ArtifactStatus::of_file(&workspace.artifact_path(kind, &id));
        let sorting = |kind| ArtifactStatus::of_sorting(&workspace.artifact_path(kind, &id));
        Self {
            filtered: file(ArtifactKind::Filtered),
            shifted: file(ArtifactKind::Shifted),
            stats: file(ArtifactKind::Stats),
            high_activity: file(ArtifactKind::HighActivity),
            reference_sorting: sorting(ArtifactKind::ReferenceSorting),
            spike_sorting: sorting(ArtifactKind::SpikeSorting),
            preview: file(ArtifactKind::SegmentPreview),
            id,
        }
    }

    /// Number of complete artifacts, out of the seven tracked.
    pub fn completed(&self) -> usize {
        [
            self.filtered,
            self.shifted,
            self.stats,
            self.high_activity,
            self.reference_sorting,
            self.spike_sorting,
            self.preview,
        ]
        .iter()
        .filter(|s| s.is_complete())
        .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub name: String,
    pub segments: Vec<SegmentStatus>,
    pub epoch_sorting: ArtifactStatus,
    pub epoch_preview: ArtifactStatus,
}

impl BlockStatus {
    /// Whether every segment of a non-empty block has been sorted.
    pub fn all_sorted(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.spike_sorting.is_complete())
    }
}

/// Point-in-time view of the workspace used for scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub reference: Option<SegmentId>,
    pub shift_coeffs: ArtifactStatus,
    pub blocks: Vec<BlockStatus>,
}

impl TreeSnapshot {
    pub fn capture(workspace: &Workspace, reference: Option<SegmentId>) -> Result<Self> {
        let mut blocks = Vec::new();
        for name in workspace.raw_blocks()? {
            let segments = workspace
                .raw_segments(&name)?
                .into_iter()
                .map(|id| SegmentStatus::capture(workspace, id))
                .collect();
            blocks.push(BlockStatus {
                epoch_sorting: ArtifactStatus::of_sorting(&workspace.epoch_sorting_dir(&name)),
                epoch_preview: ArtifactStatus::of_file(&workspace.epoch_preview_path(&name)),
                segments,
                name,
            });
        }
        Ok(Self {
            reference,
            shift_coeffs: ArtifactStatus::of_file(&workspace.shift_coeffs_path()),
            blocks,
        })
    }

    pub fn segment(&self, id: &SegmentId) -> Option<&SegmentStatus> {
        self.blocks
            .iter()
            .find(|b| b.name == id.block)?
            .segments
            .iter()
            .find(|s| s.id == *id)
    }

    /// Status of the designated reference segment, if it has been ingested.
    pub fn reference_segment(&self) -> Option<&SegmentStatus> {
        self.segment(self.reference.as_ref()?)
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentStatus> {
        self.blocks.iter().flat_map(|b| b.segments.iter())
    }

    pub fn num_segments(&self) -> usize {
        self.blocks.iter().map(|b| b.segments.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;
    use ndarray::Array2;

    #[test]
    fn test_snapshot_reflects_files() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let seg = SegmentId::new("block_a", 1);
        storage::write_samples(&ws.artifact_path(ArtifactKind::Raw, &seg), &Array2::zeros((4, 2)))
            .unwrap();
        storage::write_samples(
            &ws.artifact_path(ArtifactKind::Filtered, &seg),
            &Array2::zeros((4, 2)),
        )
        .unwrap();

        let snapshot = TreeSnapshot::capture(&ws, Some(seg.clone())).unwrap();
        assert_eq!(snapshot.num_segments(), 1);
        let status = snapshot.reference_segment().unwrap();
        assert_eq!(status.filtered, ArtifactStatus::Complete);
        assert_eq!(status.shifted, ArtifactStatus::Pending);
        assert_eq!(status.completed(), 1);
        assert!(!snapshot.blocks[0].all_sorted());
        assert_eq!(snapshot.shift_coeffs, ArtifactStatus::Pending);
    }

    #[test]
    fn test_missing_reference_segment() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let snapshot = TreeSnapshot::capture(&ws, Some(SegmentId::new("nope", 1))).unwrap();
        assert!(snapshot.reference_segment().is_none());
        assert!(snapshot.blocks.is_empty());
    }
}
