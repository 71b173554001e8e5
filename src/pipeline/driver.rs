//! The polling driver.
//!
//! One tick ingests settled batches, re-reads the reference designation,
//! snapshots the workspace and then runs at most one unit of work per stage.
//! Stage failures are logged and retried on a later tick.

use crate::config::{Config, ElectrodeCoords};
use crate::diagnostics::SEPARATION_NEIGHBORS;
use crate::dsp::{
    apply_time_shifts, bandpass_filter, compute_channel_spike_stats, detect_high_activity,
    optimize_time_shift, ChannelSpikeStats, HighActivity, ShiftCoefficients,
};
use crate::epoch::{aggregate_epoch, SegmentSorting};
use crate::error::{PipelineError, Result};
use crate::ingest::Ingestor;
use crate::layout::{ArtifactKind, SegmentId, Workspace};
use crate::pipeline::ledger::RunLedger;
use crate::pipeline::scheduler::{next_per_stage, plan, reference_gate, Blocked, Stage, Target, WorkItem};
use crate::pipeline::status::TreeSnapshot;
use crate::preview::{EpochPreview, SegmentPreview, SortingView};
use crate::sorting::{classify_segment, reference_sort, ReferenceCatalog, Sorting};
use crate::storage;
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// What a tick did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Blocks materialized by ingest
    pub ingested: Vec<(String, usize)>,
    /// Set when the reference gate held every stage back
    pub blocked: Option<Blocked>,
    pub completed: Vec<WorkItem>,
    pub failed: Vec<(WorkItem, String)>,
}

impl TickReport {
    pub fn did_work(&self) -> bool {
        !self.ingested.is_empty() || !self.completed.is_empty()
    }
}

/// Single-threaded pipeline driver over one workspace.
pub struct Driver {
    workspace: Workspace,
    config: Config,
    coords: ElectrodeCoords,
    ingestor: Ingestor,
    ledger: RunLedger,
    last_blocked: Option<Blocked>,
}

impl Driver {
    pub fn new(workspace: Workspace, config: Config, coords: ElectrodeCoords) -> Self {
        let ingestor = Ingestor::new(workspace.clone(), &config);
        let ledger = RunLedger::with_persistence(workspace.ledger_path());
        Self {
            workspace,
            config,
            coords,
            ingestor,
            ledger,
            last_blocked: None,
        }
    }

    /// Load and validate `config.yaml` and `electrode_coords.txt` from the
    /// workspace root.
    pub fn open(workspace: Workspace) -> Result<Self> {
        let config = Config::load(&workspace.config_path())?;
        let coords = ElectrodeCoords::load(&workspace.coords_path(), config.n_channels)?;
        workspace.ensure_directories()?;
        Ok(Self::new(workspace, config, coords))
    }

    pub fn with_ingestor(mut self, ingestor: Ingestor) -> Self {
        self.ingestor = ingestor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn tick(&mut self) -> Result<TickReport> {
        self.tick_at(SystemTime::now())
    }

    /// Run one tick, using `now` for the ingest settle check.
    pub fn tick_at(&mut self, now: SystemTime) -> Result<TickReport> {
        let mut report = TickReport::default();

        match self.ingestor.scan_and_ingest_at(now) {
            Ok(ingest) => {
                self.ledger.record_blocks_ingested(ingest.ingested.len() as u64);
                report.ingested = ingest.ingested;
            }
            Err(e) => warn!(error = %e, "ingest scan failed"),
        }

        let reference = match self.workspace.read_reference() {
            Ok(reference) => reference,
            Err(e) => {
                warn!(error = %e, "ignoring reference designation");
                None
            }
        };

        let snapshot = TreeSnapshot::capture(&self.workspace, reference)?;
        let blocked = reference_gate(&snapshot).err();
        if blocked != self.last_blocked {
            match &blocked {
                Some(Blocked::NoReference) => info!(
                    "waiting for reference_segment.txt (example content: block_001/segment_001.bin)"
                ),
                Some(Blocked::ReferenceNotIngested(id)) => {
                    info!(reference = %id, "waiting for reference segment to be ingested")
                }
                None => {}
            }
            self.last_blocked = blocked.clone();
        }

        if let (None, Some(reference)) = (&blocked, snapshot.reference.as_ref()) {
            for item in next_per_stage(&plan(&snapshot)) {
                let started = Instant::now();
                match self.execute(&item, reference) {
                    Ok(true) => {
                        info!(
                            stage = %item.stage,
                            target = %item.target,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "stage complete"
                        );
                        self.ledger.record_completed(item.stage);
                        report.completed.push(item);
                    }
                    Ok(false) => debug!(stage = %item.stage, target = %item.target, "output already present"),
                    Err(e) => {
                        warn!(stage = %item.stage, target = %item.target, error = %e, "stage failed, will retry");
                        self.ledger.record_failed(item.stage);
                        report.failed.push((item, e.to_string()));
                    }
                }
            }
        }
        report.blocked = blocked;

        if let Err(e) = self.ledger.save() {
            warn!(error = %e, "could not save run ledger");
        }
        Ok(report)
    }

    /// Tick until a tick does no work or `max_ticks` is reached. Returns the
    /// number of ticks that did work.
    pub fn run_until_idle(&mut self, now: SystemTime, max_ticks: usize) -> Result<usize> {
        let mut busy = 0;
        for _ in 0..max_ticks {
            if !self.tick_at(now)?.did_work() {
                break;
            }
            busy += 1;
        }
        Ok(busy)
    }

    /// Poll until `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) {
        let poll = Duration::from_secs(self.config.poll_interval_secs);
        while running.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(report) if report.did_work() => debug!(
                    ingested = report.ingested.len(),
                    completed = report.completed.len(),
                    failed = report.failed.len(),
                    "tick finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "tick failed"),
            }

            let deadline = Instant::now() + poll;
            while running.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    /// Run one work item. Returns `Ok(false)` when its output already exists.
    fn execute(&self, item: &WorkItem, reference: &SegmentId) -> Result<bool> {
        match (&item.target, item.stage) {
            (Target::Segment(id), Stage::Filtering) => self.filter(id),
            (Target::Segment(_), Stage::ShiftCoefficients) => self.estimate_shift(reference),
            (Target::Segment(id), Stage::Shifting) => self.shift(id),
            (Target::Segment(id), Stage::Stats) => self.stats(id),
            (Target::Segment(id), Stage::HighActivity) => self.high_activity(id),
            (Target::Segment(id), Stage::ReferenceSorting) => self.reference_sorting(id),
            (Target::Segment(id), Stage::SpikeSorting) => self.spike_sorting(id, reference),
            (Target::Segment(id), Stage::SegmentPreview) => self.segment_preview(id, reference),
            (Target::Block(block), Stage::EpochSorting) => self.epoch_sorting(block),
            (Target::Block(block), Stage::EpochPreview) => self.epoch_preview(block),
            (target, stage) => Err(PipelineError::Configuration(format!(
                "stage {stage} cannot run on {target}"
            ))),
        }
    }

    fn fs(&self) -> f64 {
        self.config.sampling_frequency
    }

    fn read_samples(&self, kind: ArtifactKind, id: &SegmentId) -> Result<Array2<i16>> {
        storage::read_samples(&self.workspace.artifact_path(kind, id), self.config.n_channels)
    }

    fn read_high_activity(&self, id: &SegmentId) -> Result<HighActivity> {
        storage::read_json(&self.workspace.artifact_path(ArtifactKind::HighActivity, id))
    }

    fn filter(&self, id: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::Filtered, id);
        if out.exists() {
            return Ok(false);
        }
        let raw = self.read_samples(ArtifactKind::Raw, id)?;
        let filtered = bandpass_filter(&raw, self.fs(), &self.config.filter_params);
        storage::write_samples(&out, &filtered)?;
        Ok(true)
    }

    fn estimate_shift(&self, reference: &SegmentId) -> Result<bool> {
        let out = self.workspace.shift_coeffs_path();
        if out.exists() {
            return Ok(false);
        }
        let started = Instant::now();
        let filtered = self.read_samples(ArtifactKind::Filtered, reference)?;
        let coeffs = optimize_time_shift(&filtered, &self.coords, self.fs());
        info!(c_x = coeffs.c_x, c_y = coeffs.c_y, "estimated shift coefficients");
        storage::write_info(&out, started)?;
        storage::write_yaml(&out, &coeffs)?;
        Ok(true)
    }

    fn shift(&self, id: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::Shifted, id);
        if out.exists() {
            return Ok(false);
        }
        let coeffs: ShiftCoefficients = storage::read_yaml(&self.workspace.shift_coeffs_path())?;
        let filtered = self.read_samples(ArtifactKind::Filtered, id)?;
        let shifted = apply_time_shifts(&filtered, &coeffs, &self.coords, self.fs());
        storage::write_samples(&out, &shifted)?;
        Ok(true)
    }

    fn stats(&self, id: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::Stats, id);
        if out.exists() {
            return Ok(false);
        }
        let started = Instant::now();
        let filtered = self.read_samples(ArtifactKind::Filtered, id)?;
        let stats = compute_channel_spike_stats(
            &filtered,
            self.fs(),
            self.config.detect_threshold_for_spike_stats,
        );
        storage::write_json_artifact(&out, &stats, started)?;
        Ok(true)
    }

    fn high_activity(&self, id: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::HighActivity, id);
        if out.exists() {
            return Ok(false);
        }
        let started = Instant::now();
        let filtered = self.read_samples(ArtifactKind::Filtered, id)?;
        let intervals = detect_high_activity(&filtered, self.fs(), self.config.high_activity_threshold);
        debug!(
            segment = %id,
            intervals = intervals.high_activity_intervals.len(),
            seconds = intervals.total_duration_sec(),
            "high activity detected"
        );
        storage::write_json_artifact(&out, &intervals, started)?;
        Ok(true)
    }

    fn reference_sorting(&self, id: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::ReferenceSorting, id);
        if Sorting::is_complete(&out) {
            return Ok(false);
        }
        let shifted = self.read_samples(ArtifactKind::Shifted, id)?;
        let high_activity = self.read_high_activity(id)?;
        let sorting = reference_sort(
            &shifted,
            &high_activity.high_activity_intervals,
            self.fs(),
            &self.coords,
            self.config.coarse_sorting_detect_threshold,
            &self.config.sorting,
        );
        info!(
            segment = %id,
            spikes = sorting.num_spikes(),
            units = sorting.num_units(),
            "reference sorting computed"
        );
        sorting.write(&out)?;
        Ok(true)
    }

    /// Labelled reference spikes, read from the reference artifacts as they
    /// are on disk now.
    fn load_catalog(&self, reference: &SegmentId) -> Result<ReferenceCatalog> {
        let dir = self.workspace.artifact_path(ArtifactKind::ReferenceSorting, reference);
        if !Sorting::is_complete(&dir) {
            return Err(PipelineError::ReferenceNotReady);
        }
        let sorting = Sorting::read(&dir)?;
        let shifted = self.read_samples(ArtifactKind::Shifted, reference)?;
        let catalog = ReferenceCatalog::from_sorting(&sorting, &shifted, self.fs());
        debug!(reference = %reference, spikes = catalog.len(), "loaded reference catalog");
        Ok(catalog)
    }

    fn spike_sorting(&self, id: &SegmentId, reference: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::SpikeSorting, id);
        if Sorting::is_complete(&out) {
            return Ok(false);
        }
        let catalog = self.load_catalog(reference)?;
        let shifted = self.read_samples(ArtifactKind::Shifted, id)?;
        let high_activity = self.read_high_activity(id)?;
        let sorting = classify_segment(
            &shifted,
            &high_activity.high_activity_intervals,
            self.fs(),
            &self.coords,
            self.config.coarse_sorting_detect_threshold,
            &self.config.sorting,
            &catalog,
        )?;
        sorting.write(&out)?;
        Ok(true)
    }

    fn epoch_sorting(&self, block: &str) -> Result<bool> {
        let out = self.workspace.epoch_sorting_dir(block);
        if Sorting::is_complete(&out) {
            return Ok(false);
        }
        let mut segments = Vec::new();
        for id in self.workspace.raw_segments(block)? {
            let dir = self.workspace.artifact_path(ArtifactKind::SpikeSorting, &id);
            segments.push(SegmentSorting {
                number: id.number,
                sorting: Sorting::read(&dir)?,
            });
        }
        let sorting = aggregate_epoch(
            segments,
            self.config.raw_segment_duration_sec,
            self.config.n_channels,
        );
        sorting.write(&out)?;
        Ok(true)
    }

    fn epoch_preview(&self, block: &str) -> Result<bool> {
        let out = self.workspace.epoch_preview_path(block);
        if out.exists() {
            return Ok(false);
        }
        let started = Instant::now();
        let sorting = Sorting::read(&self.workspace.epoch_sorting_dir(block))?;
        let num_segments = self.workspace.raw_segments(block)?.len();
        let preview = EpochPreview::build(
            block,
            &sorting,
            num_segments,
            self.config.raw_segment_duration_sec,
            self.fs(),
            self.coords.positions().to_vec(),
        );
        storage::write_json_artifact(&out, &preview, started)?;
        Ok(true)
    }

    fn segment_preview(&self, id: &SegmentId, reference: &SegmentId) -> Result<bool> {
        let out = self.workspace.artifact_path(ArtifactKind::SegmentPreview, id);
        if out.exists() {
            return Ok(false);
        }
        let started = Instant::now();
        let stats: ChannelSpikeStats =
            storage::read_json(&self.workspace.artifact_path(ArtifactKind::Stats, id))?;
        let high_activity = self.read_high_activity(id)?;
        let shifted = self.read_samples(ArtifactKind::Shifted, id)?;

        let view = |kind: ArtifactKind| -> Result<Option<SortingView>> {
            let dir = self.workspace.artifact_path(kind, id);
            if !Sorting::is_complete(&dir) {
                return Ok(None);
            }
            let sorting = Sorting::read(&dir)?;
            Ok(Some(SortingView::build(
                &sorting,
                Some(&shifted),
                self.fs(),
                SEPARATION_NEIGHBORS,
            )))
        };
        let reference_sorting = if id == reference {
            view(ArtifactKind::ReferenceSorting)?
        } else {
            None
        };
        let spike_sorting = view(ArtifactKind::SpikeSorting)?;

        let preview = SegmentPreview {
            block: id.block.clone(),
            segment: id.file_name(),
            sampling_frequency: self.fs(),
            electrode_coords: self.coords.positions().to_vec(),
            stats,
            high_activity_intervals: high_activity.high_activity_intervals,
            reference_sorting,
            spike_sorting,
        };
        storage::write_json_artifact(&out, &preview, started)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            sampling_frequency: 1000.0,
            n_channels: 2,
            raw_segment_duration_sec: 1.0,
            filter_params: crate::config::FilterParams {
                lowcut: 10.0,
                highcut: 200.0,
                order: 2,
            },
            ..Config::default()
        }
    }

    fn driver(dir: &std::path::Path) -> Driver {
        let coords = ElectrodeCoords::from_positions(vec![(0.0, 0.0), (10.0, 0.0)]);
        Driver::new(Workspace::new(dir), small_config(), coords)
    }

    #[test]
    fn test_idle_without_reference() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let seg = SegmentId::new("block_a", 1);
        storage::write_samples(&ws.artifact_path(ArtifactKind::Raw, &seg), &Array2::zeros((1000, 2)))
            .unwrap();

        let mut d = driver(dir.path());
        let report = d.tick().unwrap();
        assert_eq!(report.blocked, Some(Blocked::NoReference));
        assert!(report.completed.is_empty());
        assert!(!ws.artifact_path(ArtifactKind::Filtered, &seg).exists());
    }

    #[test]
    fn test_one_item_per_stage_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        for n in 1..=3 {
            let seg = SegmentId::new("block_a", n);
            storage::write_samples(&ws.artifact_path(ArtifactKind::Raw, &seg), &Array2::zeros((1000, 2)))
                .unwrap();
        }
        ws.write_reference(&SegmentId::new("block_a", 1)).unwrap();

        let mut d = driver(dir.path());
        let report = d.tick().unwrap();
        assert_eq!(report.blocked, None);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].stage, Stage::Filtering);
        assert_eq!(d.ledger().stats().completed(Stage::Filtering), 1);
    }

    #[test]
    fn test_malformed_reference_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reference_segment.txt"), "not a segment").unwrap();
        let mut d = driver(dir.path());
        let report = d.tick().unwrap();
        assert_eq!(report.blocked, Some(Blocked::NoReference));
    }

    #[test]
    fn test_empty_reference_catalog_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let reference = SegmentId::new("block_a", 1);
        let other = SegmentId::new("block_a", 2);
        let mut with_spike = Array2::<i16>::zeros((1000, 2));
        with_spike[[100, 0]] = -200;
        for (id, data) in [(&reference, Array2::zeros((1000, 2))), (&other, with_spike)] {
            for kind in [ArtifactKind::Raw, ArtifactKind::Filtered, ArtifactKind::Shifted] {
                storage::write_samples(&ws.artifact_path(kind, id), &data).unwrap();
            }
            storage::write_json(&ws.artifact_path(ArtifactKind::HighActivity, id), &HighActivity::default())
                .unwrap();
        }
        storage::write_yaml(&ws.shift_coeffs_path(), &ShiftCoefficients { c_x: 0.0, c_y: 0.0 }).unwrap();
        Sorting::empty(2)
            .write(&ws.artifact_path(ArtifactKind::ReferenceSorting, &reference))
            .unwrap();
        Sorting::empty(2)
            .write(&ws.artifact_path(ArtifactKind::SpikeSorting, &reference))
            .unwrap();
        ws.write_reference(&reference).unwrap();

        let sorting_item = WorkItem {
            stage: Stage::SpikeSorting,
            target: Target::Segment(other.clone()),
        };
        let mut d = driver(dir.path());
        for attempt in 1..=2 {
            let report = d.tick().unwrap();
            let (item, reason) = report
                .failed
                .iter()
                .find(|(item, _)| item.stage == Stage::SpikeSorting)
                .expect("sorting should fail");
            assert_eq!(item, &sorting_item);
            assert!(reason.contains("reference catalog is empty"), "{reason}");
            assert_eq!(d.ledger().stats().failed(Stage::SpikeSorting), attempt);
            assert!(!Sorting::is_complete(&ws.artifact_path(ArtifactKind::SpikeSorting, &other)));
        }
    }
}
