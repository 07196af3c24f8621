// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Named, checksummed artifacts on disk
//!
//! Every artifact is one `<dir>/<name>.bin` file holding a bincode
//! `Envelope`: what kind of object it is, when it was written, a SHA-256 of
//! the payload and the payload itself.

use crate::classifiers::Classifier;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const FORMAT_VERSION: u32 = 1;
const EXTENSION: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Model,
    Preprocessor,
    LabelSpace,
    Backbone,
    TrainingSummary,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: ArtifactKind,
    format_version: u32,
    saved_at: DateTime<Utc>,
    sha256: String,
    payload: Vec<u8>,
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Directory of persisted artifacts; single writer, no locking
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where `name` lives, after checking the name is a plain file stem
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(PipelineError::Config(format!(
                "artifact name '{}' must be non-empty and contain no path separators",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.{}", name, EXTENSION)))
    }

    /// Serialize `value` and write it, replacing any previous artifact of that name
    pub fn save<T: Serialize>(&self, name: &str, kind: ArtifactKind, value: &T) -> Result<PathBuf> {
        let payload = bincode::serialize(value).map_err(|e| PipelineError::ArtifactCorrupt {
            name: name.to_string(),
            reason: format!("failed to serialize: {}", e),
        })?;
        self.write(name, kind, payload)
    }

    /// Persist a fitted model through its own byte encoding
    pub fn save_model<C: Classifier>(&self, name: &str, model: &C) -> Result<PathBuf> {
        self.write(name, ArtifactKind::Model, model.to_bytes()?)
    }

    fn write(&self, name: &str, kind: ArtifactKind, payload: Vec<u8>) -> Result<PathBuf> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir).map_err(|e| PipelineError::io(&self.dir, e))?;

        let envelope = Envelope {
            kind,
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            sha256: checksum(&payload),
            payload,
        };
        let bytes = bincode::serialize(&envelope).map_err(|e| PipelineError::ArtifactCorrupt {
            name: name.to_string(),
            reason: format!("failed to serialize envelope: {}", e),
        })?;

        fs::write(&path, bytes).map_err(|e| PipelineError::io(&path, e))?;
        tracing::info!("Saved {:?} artifact to {}", kind, path.display());
        Ok(path)
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str, kind: ArtifactKind) -> Result<T> {
        let path = self.path_for(name)?;
        decode(name, &read_payload(name, &path, kind)?)
    }

    pub fn load_model<C: Classifier>(&self, name: &str) -> Result<C> {
        let path = self.path_for(name)?;
        C::from_bytes(&read_payload(name, &path, ArtifactKind::Model)?).map_err(|err| match err {
            PipelineError::ArtifactCorrupt { reason, .. } => PipelineError::ArtifactCorrupt {
                name: name.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Load an artifact from an explicit file rather than by name
    pub fn load_path<T: DeserializeOwned>(path: &Path, kind: ArtifactKind) -> Result<T> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        decode(&name, &read_payload(&name, path, kind)?)
    }
}

fn decode<T: DeserializeOwned>(name: &str, payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| PipelineError::ArtifactCorrupt {
        name: name.to_string(),
        reason: format!("unreadable payload: {}", e),
    })
}

/// Checked payload bytes of the envelope at `path`
fn read_payload(name: &str, path: &Path, kind: ArtifactKind) -> Result<Vec<u8>> {
    if !path.is_file() {
        return Err(PipelineError::ArtifactNotFound {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;

    let corrupt = |reason: String| PipelineError::ArtifactCorrupt {
        name: name.to_string(),
        reason,
    };

    let envelope: Envelope =
        bincode::deserialize(&bytes).map_err(|e| corrupt(format!("unreadable envelope: {}", e)))?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} (expected {})",
            envelope.format_version, FORMAT_VERSION
        )));
    }
    if envelope.kind != kind {
        return Err(corrupt(format!("holds a {:?}, expected a {:?}", envelope.kind, kind)));
    }
    let actual = checksum(&envelope.payload);
    if actual != envelope.sha256 {
        tracing::warn!("Checksum mismatch: expected {}, got {}", envelope.sha256, actual);
        return Err(corrupt("checksum mismatch".to_string()));
    }

    tracing::debug!("Loaded {:?} artifact {} (saved {})", kind, path.display(), envelope.saved_at);
    Ok(envelope.payload)
}
