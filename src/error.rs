//! Error types shared across the pipeline.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by pipeline stages, ingest and configuration loading.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("electrode coordinates list {electrodes} entries but {channels} channels are configured")]
    DimensionMismatch { electrodes: usize, channels: usize },

    #[error("could not read epoch block {block}: {reason}")]
    IngestRead { block: String, reason: String },

    #[error("reference segment is not ready")]
    ReferenceNotReady,

    #[error("reference catalog is empty, cannot classify {queries} spikes")]
    EmptyReferenceCatalog { queries: usize },

    #[error("malformed artifact {}: {reason}", path.display())]
    MalformedArtifact { path: PathBuf, reason: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to write npy array: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("failed to read npy array: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl PipelineError {
    /// Build a closure that wraps an I/O error with the path it concerns.
    pub fn io(path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> PipelineError {
        let path = path.as_ref().to_path_buf();
        move |source| PipelineError::Io { path, source }
    }

    /// Shorthand for a malformed artifact error.
    pub fn malformed(path: impl AsRef<Path>, reason: impl Into<String>) -> PipelineError {
        PipelineError::MalformedArtifact {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Whether the error should stop the process at startup rather than be
    /// retried on a later tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_) | PipelineError::DimensionMismatch { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
