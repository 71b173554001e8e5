//! Ingest of settled acquisition batches.
//!
//! A batch directory under `acquisition/` becomes eligible once it holds at
//! least one file and none of its files (searched recursively) has been
//! modified within the settle window. Eligible batches that have no
//! `raw/<block>` directory yet are read, re-chunked into fixed-length
//! segments and committed.

pub mod normalizer;
pub mod source;

pub use normalizer::{chunk_segments, materialize_block};
pub use source::{
    source_for, AcquisitionManifest, ConcatenatedSource, SampleSource, StructuredSource,
};

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::layout::Workspace;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Outcome of one ingest scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Blocks committed during this scan, with their segment counts
    pub ingested: Vec<(String, usize)>,
    /// Blocks that were settled but could not be read
    pub failed: Vec<String>,
}

/// Detects settled batches and materializes them as raw segments.
pub struct Ingestor {
    workspace: Workspace,
    n_channels: usize,
    samples_per_segment: usize,
    settle: Duration,
    source: Box<dyn SampleSource>,
}

impl Ingestor {
    pub fn new(workspace: Workspace, config: &Config) -> Self {
        Self {
            workspace,
            n_channels: config.n_channels,
            samples_per_segment: config.samples_per_segment(),
            settle: Duration::from_secs(config.settle_secs),
            source: source_for(config.acquisition_format),
        }
    }

    /// Replace the batch reader.
    pub fn with_source(mut self, source: Box<dyn SampleSource>) -> Self {
        self.source = source;
        self
    }

    pub fn scan_and_ingest(&self) -> Result<IngestReport> {
        self.scan_and_ingest_at(SystemTime::now())
    }

    /// Scan using `now` as the current time.
    pub fn scan_and_ingest_at(&self, now: SystemTime) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        for block in self.workspace.acquisition_blocks()? {
            if self.workspace.block_raw_dir(&block).exists() {
                continue;
            }
            let block_dir = self.workspace.acquisition_dir().join(&block);
            match is_settled(&block_dir, now, self.settle) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(block = %block, error = %e, "could not inspect epoch block, will retry");
                    report.failed.push(block);
                    continue;
                }
            }

            info!(block = %block, source = self.source.name(), "ingesting epoch block");
            let data = match self.source.read_block(&block_dir, self.n_channels) {
                Ok(data) => data,
                Err(e) => {
                    warn!(block = %block, error = %e, "could not read epoch block, will retry");
                    report.failed.push(block);
                    continue;
                }
            };

            match materialize_block(&self.workspace, &block, &data, self.samples_per_segment) {
                Ok(count) => {
                    info!(block = %block, segments = count, "epoch block materialized");
                    report.ingested.push((block, count));
                }
                Err(e) => {
                    warn!(block = %block, error = %e, "could not write raw segments, will retry");
                    report.failed.push(block);
                }
            }
        }

        Ok(report)
    }
}

/// Whether `dir` contains at least one file and every file is older than
/// `settle` relative to `now`.
pub fn is_settled(dir: &Path, now: SystemTime, settle: Duration) -> Result<bool> {
    let mut has_files = false;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).map_err(PipelineError::io(&current))? {
            let entry = entry.map_err(PipelineError::io(&current))?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(PipelineError::io(&path))?;
            if metadata.is_dir() {
                stack.push(path);
                continue;
            }
            has_files = true;
            let modified = metadata.modified().map_err(PipelineError::io(&path))?;
            // a timestamp in the future counts as fresh
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < settle {
                return Ok(false);
            }
        }
    }

    Ok(has_files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            n_channels: 2,
            sampling_frequency: 10.0,
            raw_segment_duration_sec: 1.0,
            filter_params: crate::config::FilterParams {
                lowcut: 1.0,
                highcut: 4.0,
                order: 2,
            },
            ..Config::default()
        }
    }

    fn write_frames(path: &Path, n_frames: usize) {
        let bytes: Vec<u8> = (0..n_frames * 2)
            .flat_map(|v| (v as i16).to_le_bytes())
            .collect();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_settle_window() {
        let dir = tempfile::tempdir().unwrap();
        let settle = Duration::from_secs(5);
        assert!(!is_settled(dir.path(), SystemTime::now(), settle).unwrap());

        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("data.bin"), b"x").unwrap();
        assert!(!is_settled(dir.path(), SystemTime::now(), settle).unwrap());

        let later = SystemTime::now() + Duration::from_secs(60);
        assert!(is_settled(dir.path(), later, settle).unwrap());
    }

    #[test]
    fn test_ingest_settled_block_once() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_directories().unwrap();
        let block_dir = ws.acquisition_dir().join("b1");
        std::fs::create_dir_all(&block_dir).unwrap();
        write_frames(&block_dir.join("part_000.bin"), 25);

        let ingestor = Ingestor::new(ws.clone(), &test_config());

        let report = ingestor.scan_and_ingest_at(SystemTime::now()).unwrap();
        assert!(report.ingested.is_empty());

        let later = SystemTime::now() + Duration::from_secs(60);
        let report = ingestor.scan_and_ingest_at(later).unwrap();
        assert_eq!(report.ingested, vec![("b1".to_string(), 2)]);
        assert_eq!(ws.raw_segments("b1").unwrap().len(), 2);

        let report = ingestor.scan_and_ingest_at(later).unwrap();
        assert_eq!(report, IngestReport::default());
    }

    #[cfg(unix)]
    #[test]
    fn test_uninspectable_block_does_not_stop_scan() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_directories().unwrap();
        let locked = ws.acquisition_dir().join("a_locked").join("sub");
        std::fs::create_dir_all(&locked).unwrap();
        write_frames(&locked.join("part.bin"), 10);
        let good = ws.acquisition_dir().join("b_good");
        std::fs::create_dir_all(&good).unwrap();
        write_frames(&good.join("part.bin"), 10);

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // permission bits do not bind a privileged user
        let enforced = std::fs::read_dir(&locked).is_err();

        let ingestor = Ingestor::new(ws.clone(), &test_config());
        let report = ingestor
            .scan_and_ingest_at(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(report.ingested.contains(&("b_good".to_string(), 1)));
        if enforced {
            assert_eq!(report.failed, vec!["a_locked".to_string()]);
            assert!(!ws.block_raw_dir("a_locked").exists());
        }
    }

    #[test]
    fn test_unreadable_block_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_directories().unwrap();
        let block_dir = ws.acquisition_dir().join("b1");
        std::fs::create_dir_all(&block_dir).unwrap();
        std::fs::write(block_dir.join("part.bin"), [0u8; 3]).unwrap();

        let ingestor = Ingestor::new(ws.clone(), &test_config());
        let later = SystemTime::now() + Duration::from_secs(60);
        let report = ingestor.scan_and_ingest_at(later).unwrap();
        assert_eq!(report.failed, vec!["b1".to_string()]);
        assert!(!ws.block_raw_dir("b1").exists());

        write_frames(&block_dir.join("part.bin"), 10);
        let later = SystemTime::now() + Duration::from_secs(60);
        let report = ingestor.scan_and_ingest_at(later).unwrap();
        assert_eq!(report.ingested, vec![("b1".to_string(), 1)]);
    }
}
