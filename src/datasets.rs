// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Dataset ingestion
//!
//! Loads the two supported layouts into memory:
//! - Tabular: a delimited file with a header row
//! - Image: a `filename,label` manifest plus a directory of image files
//!
//! Also provides the seeded train/test partition used by both variants.

use crate::config::MissingImagePolicy;
use crate::error::{PipelineError, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Component, Path, PathBuf};

/// Rows of a delimited file, kept as raw strings until encoding
#[derive(Debug, Clone)]
pub struct TabularDataset {
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TabularDataset {
    /// Load a delimited file and check that every required column is present
    pub fn load(path: &Path, required_columns: &[String]) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::DatasetNotFound {
                path: path.to_path_buf(),
            });
        }

        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| PipelineError::SchemaMismatch {
                path: path.to_path_buf(),
                reason: format!("unreadable header row: {}", e),
            })?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let missing: Vec<&str> = required_columns
            .iter()
            .filter(|c| !headers.contains(c))
            .map(|c| c.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::SchemaMismatch {
                path: path.to_path_buf(),
                reason: format!("missing required columns: {}", missing.join(", ")),
            });
        }

        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.map_err(|e| PipelineError::unreadable(idx, path, e.to_string()))?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }

        tracing::info!("Loaded {} rows from {}", rows.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column in the header row
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| PipelineError::SchemaMismatch {
                path: self.path.clone(),
                reason: format!("missing required column: {}", name),
            })
    }
}

/// One labelled image reference from the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Position in the manifest (0-based, data rows only)
    pub index: usize,
    pub filename: String,
    pub label: String,
    pub path: PathBuf,
}

/// Image manifest with every filename resolved inside the image directory
#[derive(Debug, Clone)]
pub struct ImageManifest {
    pub manifest_path: PathBuf,
    pub image_dir: PathBuf,
    pub records: Vec<ImageRecord>,
    /// Records dropped under `MissingImagePolicy::Skip`
    pub skipped: Vec<usize>,
}

impl ImageManifest {
    pub fn load(manifest_path: &Path, image_dir: &Path, policy: MissingImagePolicy) -> Result<Self> {
        if !manifest_path.is_file() {
            return Err(PipelineError::DatasetNotFound {
                path: manifest_path.to_path_buf(),
            });
        }
        if !image_dir.is_dir() {
            return Err(PipelineError::DatasetNotFound {
                path: image_dir.to_path_buf(),
            });
        }

        let file = File::open(manifest_path).map_err(|e| PipelineError::io(manifest_path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let headers = reader.headers().map_err(|e| PipelineError::SchemaMismatch {
            path: manifest_path.to_path_buf(),
            reason: format!("unreadable header row: {}", e),
        })?;
        let filename_col = headers.iter().position(|h| h == "filename");
        let label_col = headers.iter().position(|h| h == "label");
        let (filename_col, label_col) = match (filename_col, label_col) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(PipelineError::SchemaMismatch {
                    path: manifest_path.to_path_buf(),
                    reason: "manifest must have 'filename' and 'label' columns".to_string(),
                })
            }
        };

        let mut records = Vec::new();
        let mut skipped = Vec::new();

        for (idx, result) in reader.records().enumerate() {
            let row = result.map_err(|e| PipelineError::unreadable(idx, manifest_path, e.to_string()))?;
            let filename = row.get(filename_col).unwrap_or("").to_string();
            let label = row.get(label_col).unwrap_or("").to_string();

            let checked = if label.is_empty() {
                Err(PipelineError::unreadable(idx, manifest_path, "empty label"))
            } else {
                resolve_image(image_dir, &filename, idx)
            };

            match (checked, policy) {
                (Ok(path), _) => records.push(ImageRecord {
                    index: idx,
                    filename,
                    label,
                    path,
                }),
                (Err(err), MissingImagePolicy::Fail) => return Err(err),
                (Err(err), MissingImagePolicy::Skip) => {
                    tracing::warn!("Skipping manifest record {}: {}", idx, err);
                    skipped.push(idx);
                }
            }
        }

        tracing::info!(
            "Manifest {} lists {} usable images ({} skipped)",
            manifest_path.display(),
            records.len(),
            skipped.len()
        );

        Ok(Self {
            manifest_path: manifest_path.to_path_buf(),
            image_dir: image_dir.to_path_buf(),
            records,
            skipped,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Labels in manifest order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.label.as_str())
    }
}

/// Join `filename` onto the image directory, refusing anything that escapes it
fn resolve_image(image_dir: &Path, filename: &str, record: usize) -> Result<PathBuf> {
    let relative = Path::new(filename);
    if filename.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(PipelineError::unreadable(
            record,
            image_dir.join(filename),
            "filename does not resolve inside the image directory",
        ));
    }

    let path = image_dir.join(relative);
    match File::open(&path) {
        Ok(_) if path.is_file() => Ok(path),
        Ok(_) => Err(PipelineError::unreadable(record, path, "not a regular file")),
        Err(e) => Err(PipelineError::unreadable(record, path, e.to_string())),
    }
}

/// Row indices of a seeded train/test partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffle `0..n` with a seeded RNG and hold out `ceil(n * test_fraction)` rows
///
/// The same `(n, test_fraction, seed)` always yields the same partition.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> Result<Partition> {
    if n < 2 {
        return Err(PipelineError::Config(format!(
            "cannot split {} record(s) into train and test subsets",
            n
        )));
    }
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(PipelineError::Config(format!(
            "test fraction must be in (0, 1), got {}",
            test_fraction
        )));
    }

    let n_test = ((n as f64 * test_fraction).ceil() as usize).clamp(1, n - 1);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);

    let train = indices.split_off(n_test);
    Ok(Partition {
        train,
        test: indices,
    })
}
