//! Configuration for a recording workspace.
//!
//! The workspace root holds `config.yaml` (acquisition and processing
//! parameters) and `electrode_coords.txt` (one `x y` line per channel).
//! Both are validated at startup; a failure there is fatal.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Band-pass filter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    /// High-pass corner in Hz
    pub lowcut: f64,
    /// Low-pass corner in Hz
    pub highcut: f64,
    /// Butterworth order of each of the two filters
    pub order: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            lowcut: 300.0,
            highcut: 4000.0,
            order: 4,
        }
    }
}

/// Layout of the files inside an acquisition batch directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionFormat {
    /// Headerless int16 `*.bin` files, frames by channels, read in name order
    #[default]
    Concatenated,
    /// `acquisition.json` manifest plus electrode-major `data.bin` with a
    /// leading trigger channel
    Structured,
}

/// Parameters of the clustering and matching engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortingParams {
    /// Neighbors consulted by the k-NN classifier
    pub num_neighbors: usize,
    /// Upper bound on clusters found in the reference segment
    pub max_clusters: usize,
    /// Minimum frames between two accepted spikes
    pub refractory_frames: usize,
    /// Clusters whose separation index falls below this are merged
    pub merge_separation: f64,
}

impl Default for SortingParams {
    fn default() -> Self {
        Self {
            num_neighbors: 10,
            max_clusters: 100,
            refractory_frames: 10,
            merge_separation: 3.0,
        }
    }
}

/// Main configuration, read from `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sampling rate in Hz
    pub sampling_frequency: f64,

    /// Number of recording channels (trigger channel excluded)
    pub n_channels: usize,

    /// Length of each raw segment in seconds
    pub raw_segment_duration_sec: f64,

    pub filter_params: FilterParams,

    /// Detection threshold for per-channel spike statistics (negative)
    pub detect_threshold_for_spike_stats: f64,

    /// Detection threshold for spike sorting (negative)
    pub coarse_sorting_detect_threshold: f64,

    /// Multiple of the median bin RMS above which a bin counts as high
    /// activity; 0 disables detection
    pub high_activity_threshold: f64,

    #[serde(default)]
    pub acquisition_format: AcquisitionFormat,

    /// Seconds to sleep between driver ticks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds a batch must stay unmodified before it is ingested
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    #[serde(default)]
    pub sorting: SortingParams,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_settle_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_frequency: 20_000.0,
            n_channels: 512,
            raw_segment_duration_sec: 10.0,
            filter_params: FilterParams::default(),
            detect_threshold_for_spike_stats: -40.0,
            coarse_sorting_detect_threshold: -80.0,
            high_activity_threshold: 3.0,
            acquisition_format: AcquisitionFormat::default(),
            poll_interval_secs: default_poll_interval_secs(),
            settle_secs: default_settle_secs(),
            sorting: SortingParams::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| PipelineError::Configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        crate::storage::write_atomic(path, content.as_bytes())
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::Configuration(msg));

        if !(self.sampling_frequency > 0.0) {
            return fail(format!(
                "sampling_frequency must be positive, got {}",
                self.sampling_frequency
            ));
        }
        if self.n_channels == 0 {
            return fail("n_channels must be at least 1".to_string());
        }
        if !(self.raw_segment_duration_sec > 0.0) {
            return fail(format!(
                "raw_segment_duration_sec must be positive, got {}",
                self.raw_segment_duration_sec
            ));
        }
        if self.samples_per_segment() == 0 {
            return fail("raw segments would contain no samples".to_string());
        }

        let nyquist = self.sampling_frequency / 2.0;
        let fp = &self.filter_params;
        if fp.order == 0 {
            return fail("filter_params.order must be at least 1".to_string());
        }
        if !(fp.lowcut > 0.0 && fp.lowcut < fp.highcut && fp.highcut < nyquist) {
            return fail(format!(
                "filter_params must satisfy 0 < lowcut < highcut < {nyquist}, got {} and {}",
                fp.lowcut, fp.highcut
            ));
        }

        if self.detect_threshold_for_spike_stats >= 0.0 {
            return fail(format!(
                "detect_threshold_for_spike_stats must be negative, got {}",
                self.detect_threshold_for_spike_stats
            ));
        }
        if self.coarse_sorting_detect_threshold >= 0.0 {
            return fail(format!(
                "coarse_sorting_detect_threshold must be negative, got {}",
                self.coarse_sorting_detect_threshold
            ));
        }
        if self.high_activity_threshold < 0.0 {
            return fail(format!(
                "high_activity_threshold must be non-negative, got {}",
                self.high_activity_threshold
            ));
        }

        if self.sorting.num_neighbors == 0 {
            return fail("sorting.num_neighbors must be at least 1".to_string());
        }
        if self.sorting.max_clusters == 0 {
            return fail("sorting.max_clusters must be at least 1".to_string());
        }

        Ok(())
    }

    /// Frames per raw segment.
    pub fn samples_per_segment(&self) -> usize {
        (self.sampling_frequency * self.raw_segment_duration_sec).floor() as usize
    }
}

/// Planar positions of the recording channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeCoords {
    positions: Vec<(f64, f64)>,
}

impl ElectrodeCoords {
    /// Read `electrode_coords.txt`, requiring exactly `n_channels` entries.
    pub fn load(path: &Path, n_channels: usize) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::Configuration(format!(
                "electrode coordinates file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
        Self::parse(&content, n_channels)
    }

    /// Parse whitespace-separated `x y` lines; blank lines are ignored.
    pub fn parse(content: &str, n_channels: usize) -> Result<Self> {
        let mut positions = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(PipelineError::Configuration(format!(
                    "electrode coordinates line {} must hold two values, got {:?}",
                    lineno + 1,
                    line
                )));
            }
            let parse = |s: &str| {
                s.parse::<f64>().map_err(|e| {
                    PipelineError::Configuration(format!(
                        "electrode coordinates line {}: {e}",
                        lineno + 1
                    ))
                })
            };
            positions.push((parse(fields[0])?, parse(fields[1])?));
        }

        if positions.len() != n_channels {
            return Err(PipelineError::DimensionMismatch {
                electrodes: positions.len(),
                channels: n_channels,
            });
        }
        Ok(Self { positions })
    }

    pub fn from_positions(positions: Vec<(f64, f64)>) -> Self {
        Self { positions }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn x(&self, channel: usize) -> f64 {
        self.positions[channel].0
    }

    pub fn y(&self, channel: usize) -> f64 {
        self.positions[channel].1
    }

    pub fn positions(&self) -> &[(f64, f64)] {
        &self.positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = "\
sampling_frequency: 20000
n_channels: 4
raw_segment_duration_sec: 2.0
filter_params:
  lowcut: 300
  highcut: 4000
  order: 4
detect_threshold_for_spike_stats: -40
coarse_sorting_detect_threshold: -80
high_activity_threshold: 3
";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sampling_frequency, 20_000.0);
        assert_eq!(config.n_channels, 512);
        assert_eq!(config.samples_per_segment(), 200_000);
        assert_eq!(config.acquisition_format, AcquisitionFormat::Concatenated);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_optional_fields_use_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.settle_secs, 5);
        assert_eq!(config.sorting, SortingParams::default());
        assert_eq!(config.samples_per_segment(), 40_000);
    }

    #[test]
    fn test_structured_format_parses() {
        let yaml = format!("{MINIMAL_YAML}acquisition_format: structured\n");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.acquisition_format, AcquisitionFormat::Structured);
    }

    #[test]
    fn test_thresholds_must_be_negative() {
        let mut config = Config::default();
        config.detect_threshold_for_spike_stats = 10.0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));

        let mut config = Config::default();
        config.coarse_sorting_detect_threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.high_activity_threshold = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.high_activity_threshold = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_filter_band_checked_against_nyquist() {
        let mut config = Config::default();
        config.filter_params.highcut = 12_000.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.filter_params.lowcut = 5000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_field_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "n_channels: 4\n").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.n_channels = 8;
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_electrode_coords_parsing() {
        let coords = ElectrodeCoords::parse("0 0\n10 0\n\n20 5.5\n30 0\n", 4).unwrap();
        assert_eq!(coords.len(), 4);
        assert_eq!(coords.x(2), 20.0);
        assert_eq!(coords.y(2), 5.5);
    }

    #[test]
    fn test_electrode_coords_count_mismatch() {
        let err = ElectrodeCoords::parse("0 0\n10 0\n", 4).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                electrodes: 2,
                channels: 4
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_electrode_coords_rejects_bad_lines() {
        assert!(ElectrodeCoords::parse("0 0 0\n", 1).is_err());
        assert!(ElectrodeCoords::parse("0 abc\n", 1).is_err());
    }
}
