//! Incremental processing of the workspace.
//!
//! Nothing here keeps state between ticks except the run ledger; which work
//! remains is always re-derived from the artifacts on disk.

pub mod driver;
pub mod ledger;
pub mod scheduler;
pub mod status;

pub use driver::{Driver, TickReport};
pub use ledger::{LedgerStats, RunLedger, StageCounts};
pub use scheduler::{next_per_stage, plan, reference_gate, Blocked, Stage, Target, WorkItem};
pub use status::{ArtifactStatus, BlockStatus, SegmentStatus, TreeSnapshot};
