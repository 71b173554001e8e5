//! Run ledger.
//!
//! Counts completed and failed work per stage across sessions. The ledger is
//! only written back when a counter changed, so an idle driver leaves the
//! workspace untouched.

use crate::error::Result;
use crate::pipeline::scheduler::Stage;
use crate::storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct RunLedger {
    stages: BTreeMap<Stage, StageCounts>,
    blocks_ingested: u64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
    dirty: bool,
}

impl RunLedger {
    pub fn new() -> Self {
        Self {
            stages: BTreeMap::new(),
            blocks_ingested: 0,
            session_start: Utc::now(),
            persist_path: None,
            dirty: false,
        }
    }

    /// Create a ledger backed by `path`, continuing from its counters.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut ledger = Self::new();
        ledger.persist_path = Some(path);
        if let Err(e) = ledger.load() {
            warn!(error = %e, "could not load previous run ledger");
        }
        ledger
    }

    pub fn record_completed(&mut self, stage: Stage) {
        self.stages.entry(stage).or_default().completed += 1;
        self.dirty = true;
    }

    pub fn record_failed(&mut self, stage: Stage) {
        self.stages.entry(stage).or_default().failed += 1;
        self.dirty = true;
    }

    pub fn record_blocks_ingested(&mut self, count: u64) {
        if count > 0 {
            self.blocks_ingested += count;
            self.dirty = true;
        }
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            stages: Stage::ALL
                .iter()
                .map(|s| (*s, self.stages.get(s).copied().unwrap_or_default()))
                .collect(),
            blocks_ingested: self.blocks_ingested,
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the CLI.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let mut out = format!(
            "Run ledger:\n - Blocks ingested: {}\n",
            stats.blocks_ingested
        );
        for (stage, counts) in &stats.stages {
            out.push_str(&format!(
                " - {:<20} completed {:>6}  failed {:>4}\n",
                stage.name(),
                counts.completed,
                counts.failed
            ));
        }
        out
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Persist the counters if they changed. Returns whether a write happened.
    pub fn save(&mut self) -> Result<bool> {
        let Some(path) = self.persist_path.as_ref() else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        let persisted = PersistedLedger {
            stages: self
                .stages
                .iter()
                .map(|(s, c)| (s.name().to_string(), *c))
                .collect(),
            blocks_ingested: self.blocks_ingested,
            last_updated: Utc::now(),
        };
        storage::write_json(path, &persisted)?;
        self.dirty = false;
        Ok(true)
    }

    fn load(&mut self) -> Result<()> {
        let Some(path) = self.persist_path.as_ref() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let persisted: PersistedLedger = storage::read_json(path)?;
        for stage in Stage::ALL {
            if let Some(counts) = persisted.stages.get(stage.name()) {
                self.stages.insert(stage, *counts);
            }
        }
        self.blocks_ingested = persisted.blocks_ingested;
        Ok(())
    }
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of ledger counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub stages: Vec<(Stage, StageCounts)>,
    pub blocks_ingested: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl LedgerStats {
    fn counts(&self, stage: Stage) -> StageCounts {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    pub fn completed(&self, stage: Stage) -> u64 {
        self.counts(stage).completed
    }

    pub fn failed(&self, stage: Stage) -> u64 {
        self.counts(stage).failed
    }
}

/// On-disk format of `run_ledger.json`.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedLedger {
    stages: BTreeMap<String, StageCounts>,
    blocks_ingested: u64,
    last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_counting() {
        let mut ledger = RunLedger::new();
        ledger.record_completed(Stage::Filtering);
        ledger.record_completed(Stage::Filtering);
        ledger.record_failed(Stage::SpikeSorting);

        let stats = ledger.stats();
        assert_eq!(stats.completed(Stage::Filtering), 2);
        assert_eq!(stats.completed(Stage::Stats), 0);
        assert_eq!(stats.failed(Stage::SpikeSorting), 1);
        assert_eq!(stats.failed(Stage::Filtering), 0);
        assert_eq!(stats.stages.len(), Stage::ALL.len());
    }

    #[test]
    fn test_saves_only_when_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_ledger.json");
        let mut ledger = RunLedger::with_persistence(path.clone());
        assert!(!ledger.save().unwrap());
        assert!(!path.exists());

        ledger.record_blocks_ingested(0);
        assert!(!ledger.is_dirty());
        ledger.record_completed(Stage::Stats);
        assert!(ledger.save().unwrap());
        assert!(!ledger.save().unwrap());

        let reloaded = RunLedger::with_persistence(path);
        assert_eq!(reloaded.stats().completed(Stage::Stats), 1);
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_summary_format() {
        let mut ledger = RunLedger::new();
        ledger.record_blocks_ingested(2);
        let summary = ledger.summary();
        assert!(summary.contains("Blocks ingested: 2"));
        assert!(summary.contains("spike_sorting"));
    }
}
