//! Artifact persistence.
//!
//! All writers stage their output next to the final path and rename it into
//! place, so an artifact that exists is always complete. Provenance sidecars
//! are committed before the artifact itself.

use crate::error::{PipelineError, Result};
use crate::layout::INFO_SUFFIX;
use chrono::Utc;
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// Provenance recorded beside each artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceInfo {
    /// UTC time the artifact was committed, ISO 8601 with a `Z` suffix
    pub timestamp: String,
    /// Seconds spent writing the artifact
    pub elapsed_time_sec: f64,
}

impl ProvenanceInfo {
    pub fn now(elapsed_time_sec: f64) -> Self {
        Self {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            elapsed_time_sec,
        }
    }
}

/// Temporary sibling used while writing `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = format!(".{name}.{}.partial", Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(staged),
        None => PathBuf::from(staged),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(PipelineError::io(parent))?;
    }
    Ok(())
}

/// Rename a staged file or directory onto its final path.
pub fn commit(staged: &Path, path: &Path) -> Result<()> {
    std::fs::rename(staged, path).map_err(|e| {
        let _ = std::fs::remove_file(staged);
        let _ = std::fs::remove_dir_all(staged);
        PipelineError::io(path)(e)
    })
}

/// Write bytes to `path` atomically.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent(path)?;
    let staged = staging_path(path);
    if let Err(e) = std::fs::write(&staged, bytes) {
        let _ = std::fs::remove_file(&staged);
        return Err(PipelineError::io(&staged)(e));
    }
    commit(&staged, path)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path).map_err(PipelineError::io(path))?;
    serde_json::from_slice(&content).map_err(|e| PipelineError::malformed(path, e.to_string()))
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value)?;
    write_atomic(path, yaml.as_bytes())
}

pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(PipelineError::io(path))?;
    serde_yaml::from_str(&content).map_err(|e| PipelineError::malformed(path, e.to_string()))
}

/// Path of the provenance sidecar for an artifact.
pub fn info_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(INFO_SUFFIX);
    PathBuf::from(name)
}

/// Write a provenance sidecar for `path`.
pub fn write_info(path: &Path, started: Instant) -> Result<()> {
    let info = ProvenanceInfo::now(started.elapsed().as_secs_f64());
    write_json(&info_path(path), &info)
}

/// Write a JSON artifact after its provenance sidecar.
pub fn write_json_artifact<T: Serialize>(path: &Path, value: &T, started: Instant) -> Result<()> {
    write_info(path, started)?;
    write_json(path, value)
}

/// Encode a frames-by-channels matrix as row-major int16 little endian.
pub fn encode_i16(matrix: &Array2<i16>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(matrix.len() * 2);
    for value in matrix.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode row-major int16 little endian samples into frames by channels.
pub fn decode_i16(bytes: &[u8], n_channels: usize) -> Option<Array2<i16>> {
    if n_channels == 0 || bytes.len() % (2 * n_channels) != 0 {
        return None;
    }
    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let n_frames = samples.len() / n_channels;
    Array2::from_shape_vec((n_frames, n_channels), samples).ok()
}

/// Write a sample matrix and its provenance sidecar.
pub fn write_samples(path: &Path, matrix: &Array2<i16>) -> Result<()> {
    let started = Instant::now();
    ensure_parent(path)?;
    let staged = staging_path(path);
    let written = std::fs::write(&staged, encode_i16(matrix))
        .map_err(PipelineError::io(&staged))
        .and_then(|()| write_info(path, started));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }
    commit(&staged, path)
}

/// Read a sample matrix written by [`write_samples`].
pub fn read_samples(path: &Path, n_channels: usize) -> Result<Array2<i16>> {
    let bytes = std::fs::read(path).map_err(PipelineError::io(path))?;
    decode_i16(&bytes, n_channels).ok_or_else(|| {
        PipelineError::malformed(
            path,
            format!(
                "{} bytes is not a whole number of {n_channels}-channel int16 frames",
                bytes.len()
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_atomic_leaves_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        write_json(&path, &vec![1, 2, 3]).unwrap();

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["value.json"]);
        assert_eq!(read_json::<Vec<i32>>(&path).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_samples_are_row_major_little_endian() {
        let matrix = array![[1i16, -2], [300, -32768]];
        let bytes = encode_i16(&matrix);
        assert_eq!(&bytes[..4], &[1, 0, 0xFE, 0xFF]);
        assert_eq!(decode_i16(&bytes, 2).unwrap(), matrix);
        assert!(decode_i16(&bytes, 3).is_none());
    }

    #[test]
    fn test_write_samples_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        let matrix = Array2::<i16>::zeros((5, 3));
        write_samples(&path, &matrix).unwrap();

        let info: ProvenanceInfo = read_json(&info_path(&path)).unwrap();
        assert!(info.timestamp.ends_with('Z'));
        assert!(info.elapsed_time_sec >= 0.0);
        assert_eq!(read_samples(&path, 3).unwrap(), matrix);
    }

    #[test]
    fn test_failed_sidecar_removes_staged_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_001.bin");
        // a directory in the sidecar's place makes its rename fail
        std::fs::create_dir(info_path(&path)).unwrap();

        assert!(write_samples(&path, &Array2::<i16>::zeros((5, 3))).is_err());
        assert!(!path.exists());
        let leftovers: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty(), "staged files left: {leftovers:?}");
    }

    #[test]
    fn test_truncated_samples_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(matches!(
            read_samples(&path, 2),
            Err(PipelineError::MalformedArtifact { .. })
        ));
    }
}
