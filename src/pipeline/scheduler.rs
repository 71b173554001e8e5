//! Work planning.
//!
//! `plan` is a pure function of a [`TreeSnapshot`]: it lists every unit of
//! work whose inputs are complete and whose output is still missing, grouped
//! by stage in execution order.

use crate::layout::SegmentId;
use crate::pipeline::status::{SegmentStatus, TreeSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Filtering,
    ShiftCoefficients,
    Shifting,
    Stats,
    HighActivity,
    ReferenceSorting,
    SpikeSorting,
    EpochSorting,
    EpochPreview,
    SegmentPreview,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Filtering,
        Stage::ShiftCoefficients,
        Stage::Shifting,
        Stage::Stats,
        Stage::HighActivity,
        Stage::ReferenceSorting,
        Stage::SpikeSorting,
        Stage::EpochSorting,
        Stage::EpochPreview,
        Stage::SegmentPreview,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Filtering => "filtering",
            Stage::ShiftCoefficients => "shift_coefficients",
            Stage::Shifting => "shifting",
            Stage::Stats => "stats",
            Stage::HighActivity => "high_activity",
            Stage::ReferenceSorting => "reference_sorting",
            Stage::SpikeSorting => "spike_sorting",
            Stage::EpochSorting => "epoch_sorting",
            Stage::EpochPreview => "epoch_preview",
            Stage::SegmentPreview => "segment_preview",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a unit of work operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Segment(SegmentId),
    Block(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Segment(id) => write!(f, "{id}"),
            Target::Block(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub stage: Stage,
    pub target: Target,
}

impl WorkItem {
    fn segment(stage: Stage, id: &SegmentId) -> Self {
        Self {
            stage,
            target: Target::Segment(id.clone()),
        }
    }

    fn block(stage: Stage, name: &str) -> Self {
        Self {
            stage,
            target: Target::Block(name.to_string()),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.stage, self.target)
    }
}

/// Why nothing can be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    NoReference,
    ReferenceNotIngested(SegmentId),
}

/// Check the reference gate: a designation must exist and name an ingested
/// segment.
pub fn reference_gate(snapshot: &TreeSnapshot) -> Result<&SegmentStatus, Blocked> {
    let reference = snapshot.reference.as_ref().ok_or(Blocked::NoReference)?;
    snapshot
        .segment(reference)
        .ok_or_else(|| Blocked::ReferenceNotIngested(reference.clone()))
}

/// Every eligible work item, stage by stage.
pub fn plan(snapshot: &TreeSnapshot) -> Vec<WorkItem> {
    let Ok(reference) = reference_gate(snapshot) else {
        return Vec::new();
    };
    let mut items = Vec::new();

    for s in snapshot.segments() {
        if !s.filtered.is_complete() {
            items.push(WorkItem::segment(Stage::Filtering, &s.id));
        }
    }

    if !snapshot.shift_coeffs.is_complete() && reference.filtered.is_complete() {
        items.push(WorkItem::segment(Stage::ShiftCoefficients, &reference.id));
    }

    if snapshot.shift_coeffs.is_complete() {
        for s in snapshot.segments() {
            if s.filtered.is_complete() && !s.shifted.is_complete() {
                items.push(WorkItem::segment(Stage::Shifting, &s.id));
            }
        }
    }

    for s in snapshot.segments() {
        if s.filtered.is_complete() && !s.stats.is_complete() {
            items.push(WorkItem::segment(Stage::Stats, &s.id));
        }
    }

    for s in snapshot.segments() {
        if s.filtered.is_complete() && !s.high_activity.is_complete() {
            items.push(WorkItem::segment(Stage::HighActivity, &s.id));
        }
    }

    if reference.shifted.is_complete()
        && reference.high_activity.is_complete()
        && !reference.reference_sorting.is_complete()
    {
        items.push(WorkItem::segment(Stage::ReferenceSorting, &reference.id));
    }

    if reference.reference_sorting.is_complete() && reference.shifted.is_complete() {
        for s in snapshot.segments() {
            if s.shifted.is_complete() && s.high_activity.is_complete() && !s.spike_sorting.is_complete() {
                items.push(WorkItem::segment(Stage::SpikeSorting, &s.id));
            }
        }
    }

    for b in &snapshot.blocks {
        if b.all_sorted() && !b.epoch_sorting.is_complete() {
            items.push(WorkItem::block(Stage::EpochSorting, &b.name));
        }
    }

    for b in &snapshot.blocks {
        if !b.segments.is_empty() && b.epoch_sorting.is_complete() && !b.epoch_preview.is_complete() {
            items.push(WorkItem::block(Stage::EpochPreview, &b.name));
        }
    }

    for s in snapshot.segments() {
        let inputs_ready = s.filtered.is_complete()
            && s.shifted.is_complete()
            && s.stats.is_complete()
            && s.high_activity.is_complete();
        let reference_ready = s.id != reference.id || s.reference_sorting.is_complete();
        if inputs_ready && reference_ready && !s.preview.is_complete() {
            items.push(WorkItem::segment(Stage::SegmentPreview, &s.id));
        }
    }

    items
}

/// The first eligible item of each stage, in stage order.
pub fn next_per_stage(items: &[WorkItem]) -> Vec<WorkItem> {
    Stage::ALL
        .iter()
        .filter_map(|stage| items.iter().find(|i| i.stage == *stage).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::status::ArtifactStatus::{self, Complete, Pending};
    use crate::pipeline::status::BlockStatus;

    fn segment(block: &str, number: u32, done: usize) -> SegmentStatus {
        // artifacts become complete in pipeline order
        let flag = |i: usize| if i < done { Complete } else { Pending };
        SegmentStatus {
            id: SegmentId::new(block, number),
            filtered: flag(0),
            shifted: flag(1),
            stats: flag(2),
            high_activity: flag(3),
            reference_sorting: Pending,
            spike_sorting: flag(4),
            preview: flag(5),
        }
    }

    fn snapshot(segments: Vec<SegmentStatus>, coeffs: ArtifactStatus) -> TreeSnapshot {
        TreeSnapshot {
            reference: Some(SegmentId::new("b", 1)),
            shift_coeffs: coeffs,
            blocks: vec![BlockStatus {
                name: "b".into(),
                segments,
                epoch_sorting: Pending,
                epoch_preview: Pending,
            }],
        }
    }

    fn stages(items: &[WorkItem]) -> Vec<Stage> {
        items.iter().map(|i| i.stage).collect()
    }

    #[test]
    fn test_nothing_without_reference() {
        let mut snap = snapshot(vec![segment("b", 1, 0)], Pending);
        snap.reference = None;
        assert!(plan(&snap).is_empty());
        assert_eq!(reference_gate(&snap).unwrap_err(), Blocked::NoReference);

        snap.reference = Some(SegmentId::new("b", 9));
        assert!(plan(&snap).is_empty());
    }

    #[test]
    fn test_fresh_tree_only_filters() {
        let snap = snapshot(vec![segment("b", 1, 0), segment("b", 2, 0)], Pending);
        let items = plan(&snap);
        assert_eq!(stages(&items), vec![Stage::Filtering, Stage::Filtering]);
        assert_eq!(next_per_stage(&items).len(), 1);
    }

    #[test]
    fn test_shift_waits_for_coefficients() {
        let snap = snapshot(vec![segment("b", 1, 1), segment("b", 2, 1)], Pending);
        let items = plan(&snap);
        assert!(!items.iter().any(|i| i.stage == Stage::Shifting));
        assert_eq!(items[0].stage, Stage::ShiftCoefficients);
        assert_eq!(items[0].target, Target::Segment(SegmentId::new("b", 1)));

        let snap = snapshot(vec![segment("b", 1, 1), segment("b", 2, 1)], Complete);
        let next = next_per_stage(&plan(&snap));
        assert_eq!(
            stages(&next),
            vec![Stage::Shifting, Stage::Stats, Stage::HighActivity]
        );
    }

    #[test]
    fn test_spike_sorting_gated_on_reference_sorting() {
        let snap = snapshot(vec![segment("b", 1, 4), segment("b", 2, 4)], Complete);
        let items = plan(&snap);
        assert!(items.iter().any(|i| i.stage == Stage::ReferenceSorting));
        assert!(!items.iter().any(|i| i.stage == Stage::SpikeSorting));
        // the reference preview waits for its reference sorting
        let previews: Vec<_> = items
            .iter()
            .filter(|i| i.stage == Stage::SegmentPreview)
            .map(|i| i.target.clone())
            .collect();
        assert_eq!(previews, vec![Target::Segment(SegmentId::new("b", 2))]);

        let mut segments = vec![segment("b", 1, 4), segment("b", 2, 4)];
        segments[0].reference_sorting = Complete;
        let items = plan(&snapshot(segments, Complete));
        assert_eq!(
            items.iter().filter(|i| i.stage == Stage::SpikeSorting).count(),
            2
        );
    }

    #[test]
    fn test_epoch_stages_follow_block_completion() {
        let mut segments = vec![segment("b", 1, 6), segment("b", 2, 6)];
        segments[0].reference_sorting = Complete;
        let mut snap = snapshot(segments, Complete);
        assert_eq!(stages(&plan(&snap)), vec![Stage::EpochSorting]);

        snap.blocks[0].epoch_sorting = Complete;
        assert_eq!(stages(&plan(&snap)), vec![Stage::EpochPreview]);

        snap.blocks[0].epoch_preview = Complete;
        assert!(plan(&snap).is_empty());
    }
}
