//! Realtime MEA - incremental processing of multi-electrode array recordings.
//!
//! Acquisition batches dropped into a workspace are cut into fixed-length
//! segments, filtered, time-aligned and spike sorted against a designated
//! reference segment. Every derived artifact lives at a path determined by
//! its kind and segment, and its existence is the only record that the work
//! was done, so the pipeline can be stopped and restarted at any point.
//!
//! # Guarantees
//!
//! - **Idempotent**: an artifact is never recomputed once it exists
//! - **Atomic**: artifacts are staged and renamed into place
//! - **Deterministic**: identical inputs give identical outputs
//! - **Shared label space**: every segment is sorted into the reference's units
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            Realtime MEA                            │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌────────────┐   │
//! │  │  Ingest   │──▶│  Filter   │──▶│   Shift   │──▶│  Sorting   │   │
//! │  │ (batches) │   │ (bandpass)│   │ (align)   │   │ (ref + kNN)│   │
//! │  └───────────┘   └───────────┘   └───────────┘   └────────────┘   │
//! │                        │                               │          │
//! │                        ▼                               ▼          │
//! │                 ┌─────────────┐                 ┌────────────┐    │
//! │                 │ Stats, High │                 │   Epoch    │    │
//! │                 │  Activity   │                 │ Aggregate  │    │
//! │                 └─────────────┘                 └────────────┘    │
//! │                        │                               │          │
//! │                        └──────────▶  Previews  ◀───────┘          │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use realtime_mea::{Driver, Workspace};
//!
//! // Reads config.yaml and electrode_coords.txt from the workspace root
//! let mut driver = Driver::open(Workspace::new(".")).expect("invalid workspace");
//!
//! // Advance every stage by at most one unit of work
//! let report = driver.tick().expect("tick failed");
//! println!("{} items completed", report.completed.len());
//! ```

pub mod config;
pub mod diagnostics;
pub mod dsp;
pub mod epoch;
pub mod error;
pub mod ingest;
pub mod layout;
pub mod pipeline;
pub mod preview;
pub mod sorting;
pub mod storage;

// Re-export key types at crate root for convenience
pub use config::{AcquisitionFormat, Config, ElectrodeCoords, FilterParams, SortingParams};
pub use epoch::{aggregate_epoch, SegmentSorting};
pub use error::{PipelineError, Result};
pub use ingest::{IngestReport, Ingestor};
pub use layout::{ArtifactKind, SegmentId, Workspace};
pub use pipeline::{ArtifactStatus, Driver, RunLedger, Stage, TickReport, TreeSnapshot};
pub use sorting::{classify, ReferenceCatalog, Sorting};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
