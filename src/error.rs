// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error taxonomy shared by every pipeline stage

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("dataset not found: {}", path.display())]
    DatasetNotFound { path: PathBuf },

    #[error("schema mismatch in {}: {reason}", path.display())]
    SchemaMismatch { path: PathBuf, reason: String },

    #[error("record {record} unreadable ({}): {reason}", path.display())]
    RecordUnreadable {
        record: usize,
        path: PathBuf,
        reason: String,
    },

    #[error("unrecognized value '{value}' in column '{column}' (record {record})")]
    LabelValueUnrecognized {
        column: String,
        value: String,
        record: usize,
    },

    #[error("artifact '{name}' not found at {}", path.display())]
    ArtifactNotFound { name: String, path: PathBuf },

    #[error("artifact '{name}' is corrupt: {reason}")]
    ArtifactCorrupt { name: String, reason: String },

    #[error("training failed: {0}")]
    TrainingFailed(String),

    #[error("failed to render {}: {reason}", path.display())]
    RenderFailed { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid shape: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Raised by evaluation, plotting or reporting once the model is already on disk.
    #[error("model '{model}' was persisted, but the evaluation stage failed: {source}")]
    AfterPersist {
        model: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn unreadable(record: usize, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RecordUnreadable {
            record,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the trained model survived the failure
    pub fn model_was_persisted(&self) -> bool {
        matches!(self, Self::AfterPersist { .. })
    }
}

impl From<ndarray::ShapeError> for PipelineError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::ShapeMismatch {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_path() {
        let err = PipelineError::DatasetNotFound {
            path: PathBuf::from("data/games.csv"),
        };
        assert_eq!(err.to_string(), "dataset not found: data/games.csv");
    }

    #[test]
    fn test_after_persist_wraps_source() {
        let inner = PipelineError::RenderFailed {
            path: PathBuf::from("out/roc_curve.svg"),
            reason: "permission denied".to_string(),
        };
        let err = PipelineError::AfterPersist {
            model: "svm_model".to_string(),
            source: Box::new(inner),
        };
        assert!(err.model_was_persisted());
        assert!(err.to_string().contains("out/roc_curve.svg"));
    }
}
