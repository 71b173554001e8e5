//! Readers for the two acquisition batch layouts.

use crate::config::AcquisitionFormat;
use crate::error::{PipelineError, Result};
use crate::storage::decode_i16;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// Samples per read when streaming a structured batch.
pub const READ_CHUNK_SAMPLES: usize = 100_000;

/// Manifest of a structured batch.
pub const MANIFEST_FILE: &str = "acquisition.json";
/// Electrode-major sample file of a structured batch.
pub const DATA_FILE: &str = "data.bin";

/// Reads a whole acquisition batch as a frames-by-channels matrix.
pub trait SampleSource {
    fn name(&self) -> &'static str;

    /// Read the batch in `block_dir`. Rejections are reported as
    /// [`PipelineError::IngestRead`].
    fn read_block(&self, block_dir: &Path, n_channels: usize) -> Result<Array2<i16>>;
}

/// Pick the reader for a configured layout.
pub fn source_for(format: AcquisitionFormat) -> Box<dyn SampleSource> {
    match format {
        AcquisitionFormat::Concatenated => Box::new(ConcatenatedSource),
        AcquisitionFormat::Structured => Box::new(StructuredSource),
    }
}

fn block_name(block_dir: &Path) -> String {
    block_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn reject(block_dir: &Path, reason: impl Into<String>) -> PipelineError {
    PipelineError::IngestRead {
        block: block_name(block_dir),
        reason: reason.into(),
    }
}

/// Headerless int16 `*.bin` files, frames by channels, concatenated in file
/// name order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatenatedSource;

impl SampleSource for ConcatenatedSource {
    fn name(&self) -> &'static str {
        "concatenated"
    }

    fn read_block(&self, block_dir: &Path, n_channels: usize) -> Result<Array2<i16>> {
        let mut files: Vec<_> = std::fs::read_dir(block_dir)
            .map_err(PipelineError::io(block_dir))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().map(|e| e == "bin").unwrap_or(false))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(reject(block_dir, "no .bin files found"));
        }

        let mut samples: Vec<i16> = Vec::new();
        let mut used = 0usize;
        for file in &files {
            let bytes = std::fs::read(file).map_err(PipelineError::io(file))?;
            match decode_i16(&bytes, n_channels) {
                Some(part) => {
                    samples.extend(part.iter());
                    used += 1;
                }
                None => {
                    warn!(
                        file = %file.display(),
                        n_channels,
                        "size is not a multiple of the channel count, skipping"
                    );
                }
            }
        }

        if used == 0 {
            return Err(reject(block_dir, "no .bin file had a usable size"));
        }

        let n_frames = samples.len() / n_channels;
        debug!(files = used, n_frames, "read concatenated batch");
        Ok(Array2::from_shape_vec((n_frames, n_channels), samples)?)
    }
}

/// Manifest describing a structured batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionManifest {
    /// Electrodes stored in `data.bin`, the trigger channel included
    pub num_electrodes: usize,
    pub num_samples: usize,
}

/// Structured batch: `acquisition.json` plus electrode-major `data.bin`
/// whose electrode 0 is the trigger channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredSource;

impl SampleSource for StructuredSource {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn read_block(&self, block_dir: &Path, n_channels: usize) -> Result<Array2<i16>> {
        let manifest_path = block_dir.join(MANIFEST_FILE);
        let manifest: AcquisitionManifest = {
            let content = std::fs::read(&manifest_path)
                .map_err(|e| reject(block_dir, format!("cannot read {MANIFEST_FILE}: {e}")))?;
            serde_json::from_slice(&content)
                .map_err(|e| reject(block_dir, format!("invalid {MANIFEST_FILE}: {e}")))?
        };

        if manifest.num_electrodes != n_channels + 1 {
            return Err(reject(
                block_dir,
                format!(
                    "manifest lists {} electrodes, expected {} channels plus the trigger",
                    manifest.num_electrodes, n_channels
                ),
            ));
        }

        let data_path = block_dir.join(DATA_FILE);
        let mut file = File::open(&data_path)
            .map_err(|e| reject(block_dir, format!("cannot open {DATA_FILE}: {e}")))?;
        let expected = manifest
            .num_electrodes
            .checked_mul(manifest.num_samples)
            .and_then(|n| n.checked_mul(2))
            .ok_or_else(|| reject(block_dir, format!("{MANIFEST_FILE} sizes overflow")))?
            as u64;
        let actual = file.metadata().map_err(PipelineError::io(&data_path))?.len();
        if actual != expected {
            return Err(reject(
                block_dir,
                format!("{DATA_FILE} holds {actual} bytes, manifest implies {expected}"),
            ));
        }

        let total = manifest.num_samples;
        let mut data = Array2::<i16>::zeros((total, n_channels));
        let mut buf = vec![0u8; READ_CHUNK_SAMPLES * 2];

        for chunk_start in (0..total).step_by(READ_CHUNK_SAMPLES) {
            let len = READ_CHUNK_SAMPLES.min(total - chunk_start);
            // electrode 0 carries the trigger and is dropped
            for electrode in 1..manifest.num_electrodes {
                let offset = ((electrode * total + chunk_start) * 2) as u64;
                file.seek(SeekFrom::Start(offset))
                    .map_err(PipelineError::io(&data_path))?;
                file.read_exact(&mut buf[..len * 2])
                    .map_err(PipelineError::io(&data_path))?;
                for (i, pair) in buf[..len * 2].chunks_exact(2).enumerate() {
                    data[[chunk_start + i, electrode - 1]] = i16::from_le_bytes([pair[0], pair[1]]);
                }
            }
        }

        debug!(n_frames = total, "read structured batch");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_i16(path: &Path, values: &[i16]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_concatenated_reads_files_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_i16(&dir.path().join("b.bin"), &[5, 6, 7, 8]);
        write_i16(&dir.path().join("a.bin"), &[1, 2, 3, 4]);
        // odd sample count for two channels, skipped
        write_i16(&dir.path().join("c.bin"), &[9, 9, 9]);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let data = ConcatenatedSource.read_block(dir.path(), 2).unwrap();
        assert_eq!(data.dim(), (4, 2));
        assert_eq!(data.row(0).to_vec(), vec![1, 2]);
        assert_eq!(data.row(3).to_vec(), vec![7, 8]);
    }

    #[test]
    fn test_concatenated_rejects_unusable_block() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConcatenatedSource.read_block(dir.path(), 2),
            Err(PipelineError::IngestRead { .. })
        ));

        write_i16(&dir.path().join("a.bin"), &[1, 2, 3]);
        assert!(matches!(
            ConcatenatedSource.read_block(dir.path(), 2),
            Err(PipelineError::IngestRead { .. })
        ));
    }

    #[test]
    fn test_structured_drops_trigger_and_transposes() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = AcquisitionManifest {
            num_electrodes: 3,
            num_samples: 4,
        };
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        // electrode-major: trigger, then two channels
        write_i16(
            &dir.path().join(DATA_FILE),
            &[1, 0, 0, 1, 10, 11, 12, 13, 20, 21, 22, 23],
        );

        let data = StructuredSource.read_block(dir.path(), 2).unwrap();
        assert_eq!(data.dim(), (4, 2));
        assert_eq!(data.column(0).to_vec(), vec![10, 11, 12, 13]);
        assert_eq!(data.column(1).to_vec(), vec![20, 21, 22, 23]);
    }

    #[test]
    fn test_structured_rejects_channel_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"num_electrodes": 5, "num_samples": 1}"#,
        )
        .unwrap();
        write_i16(&dir.path().join(DATA_FILE), &[0; 5]);
        assert!(matches!(
            StructuredSource.read_block(dir.path(), 2),
            Err(PipelineError::IngestRead { .. })
        ));
    }

    #[test]
    fn test_structured_rejects_oversized_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = AcquisitionManifest {
            num_electrodes: 3,
            num_samples: usize::MAX / 2,
        };
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        write_i16(&dir.path().join(DATA_FILE), &[0; 6]);
        assert!(matches!(
            StructuredSource.read_block(dir.path(), 2),
            Err(PipelineError::IngestRead { .. })
        ));
    }
}
