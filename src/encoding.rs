// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Feature and label encoding
//!
//! Turns ingested records into model inputs:
//! - `LabelSpace`: stable label to index assignment, persisted with the model
//! - `TabularEncoder`: numeric columns, one derived difference column, binary target
//! - `ImageEncoder`: decode, resize and tensorise images, one-hot labels

use crate::config::{DerivedDifference, MissingImagePolicy, ResamplePolicy};
use crate::datasets::{ImageManifest, ImageRecord, TabularDataset};
use crate::error::{PipelineError, Result};
use image::imageops::FilterType;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Array4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered set of class labels; index = position of first appearance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    labels: Vec<String>,
}

impl LabelSpace {
    /// Build from labels in record order
    pub fn from_labels<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out: Vec<String> = Vec::new();
        for label in labels {
            if !out.iter().any(|l| l == label) {
                out.push(label.to_string());
            }
        }
        Self { labels: out }
    }

    /// The fixed `0`/`1` space of the tabular binary outcome
    pub fn binary() -> Self {
        Self {
            labels: vec!["0".to_string(), "1".to_string()],
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(|s| s.as_str())
    }

    pub fn names(&self) -> &[String] {
        &self.labels
    }
}

/// Encoded tabular data
#[derive(Debug, Clone)]
pub struct EncodedTable {
    /// Columns: configured features, then the derived difference
    pub features: Array2<f64>,
    pub labels: Vec<usize>,
    pub feature_names: Vec<String>,
    /// (minuend, subtrahend) per row, kept for the rating scatter plot
    pub rating_pairs: Vec<(f64, f64)>,
}

/// Numeric columns + derived difference + explicitly mapped binary target
#[derive(Debug, Clone)]
pub struct TabularEncoder {
    pub feature_columns: Vec<String>,
    pub derived: DerivedDifference,
    pub target_column: String,
    pub label_mapping: BTreeMap<String, u8>,
}

impl TabularEncoder {
    pub fn new(
        feature_columns: Vec<String>,
        derived: DerivedDifference,
        target_column: String,
        label_mapping: BTreeMap<String, u8>,
    ) -> Self {
        Self {
            feature_columns,
            derived,
            target_column,
            label_mapping,
        }
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names = self.feature_columns.clone();
        names.push(self.derived.name.clone());
        names
    }

    pub fn encode(&self, dataset: &TabularDataset) -> Result<EncodedTable> {
        let feature_idx: Vec<usize> = self
            .feature_columns
            .iter()
            .map(|c| dataset.column_index(c))
            .collect::<Result<_>>()?;
        let minuend_idx = dataset.column_index(&self.derived.minuend)?;
        let subtrahend_idx = dataset.column_index(&self.derived.subtrahend)?;
        let target_idx = dataset.column_index(&self.target_column)?;

        let n_cols = feature_idx.len() + 1;
        let mut values = Vec::with_capacity(dataset.len() * n_cols);
        let mut labels = Vec::with_capacity(dataset.len());
        let mut rating_pairs = Vec::with_capacity(dataset.len());

        for (row_idx, row) in dataset.rows.iter().enumerate() {
            for (&col, name) in feature_idx.iter().zip(&self.feature_columns) {
                values.push(parse_numeric(dataset, row, row_idx, col, name)?);
            }
            let minuend = parse_numeric(dataset, row, row_idx, minuend_idx, &self.derived.minuend)?;
            let subtrahend = parse_numeric(dataset, row, row_idx, subtrahend_idx, &self.derived.subtrahend)?;
            values.push(minuend - subtrahend);
            rating_pairs.push((minuend, subtrahend));

            let raw = row.get(target_idx).map(|s| s.as_str()).unwrap_or("");
            let label = self.label_mapping.get(raw).ok_or_else(|| PipelineError::LabelValueUnrecognized {
                column: self.target_column.clone(),
                value: raw.to_string(),
                record: row_idx,
            })?;
            labels.push(*label as usize);
        }

        let features = Array2::from_shape_vec((dataset.len(), n_cols), values)?;

        Ok(EncodedTable {
            features,
            labels,
            feature_names: self.feature_names(),
            rating_pairs,
        })
    }
}

fn parse_numeric(dataset: &TabularDataset, row: &[String], row_idx: usize, col: usize, name: &str) -> Result<f64> {
    let raw = row.get(col).map(|s| s.as_str()).unwrap_or("");
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            PipelineError::unreadable(
                row_idx,
                &dataset.path,
                format!("column '{}' holds non-numeric value '{}'", name, raw),
            )
        })
}

/// Encoded image data, rows aligned with `records`
#[derive(Debug, Clone)]
pub struct EncodedImages {
    /// (n, height, width, 3), raw 0..=255 pixel values
    pub pixels: Array4<f64>,
    pub labels: Vec<usize>,
    pub records: Vec<ImageRecord>,
}

impl EncodedImages {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Keep only the given rows, in the given order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            pixels: self.pixels.select(ndarray::Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            records: indices.iter().map(|&i| self.records[i].clone()).collect(),
        }
    }
}

/// Decode, resize and tensorise images against a fixed `LabelSpace`
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    /// (width, height)
    pub target_size: (u32, u32),
    pub resample: ResamplePolicy,
    pub policy: MissingImagePolicy,
}

impl ImageEncoder {
    pub fn new(target_size: (u32, u32), resample: ResamplePolicy, policy: MissingImagePolicy) -> Self {
        Self {
            target_size,
            resample,
            policy,
        }
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            ResamplePolicy::Nearest => FilterType::Nearest,
            ResamplePolicy::Bilinear => FilterType::Triangle,
            ResamplePolicy::Bicubic => FilterType::CatmullRom,
            ResamplePolicy::Lanczos3 => FilterType::Lanczos3,
        }
    }

    /// Encode every manifest record; labels must all belong to `label_space`
    pub fn encode(&self, manifest: &ImageManifest, label_space: &LabelSpace) -> Result<EncodedImages> {
        // Resolve labels first so an unknown label aborts before any decoding
        let indices: Vec<usize> = manifest
            .records
            .iter()
            .map(|r| {
                label_space.index_of(&r.label).ok_or_else(|| PipelineError::LabelValueUnrecognized {
                    column: "label".to_string(),
                    value: r.label.clone(),
                    record: r.index,
                })
            })
            .collect::<Result<_>>()?;

        let progress = ProgressBar::new(manifest.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        // par_iter keeps manifest order in the collected Vec
        let decoded: Vec<Result<Vec<f64>>> = manifest
            .records
            .par_iter()
            .map(|record| {
                let pixels = self.load_one(record);
                progress.inc(1);
                pixels
            })
            .collect();
        progress.finish_and_clear();

        let (width, height) = (self.target_size.0 as usize, self.target_size.1 as usize);
        let mut pixels = Vec::with_capacity(manifest.len() * width * height * 3);
        let mut labels = Vec::with_capacity(manifest.len());
        let mut records = Vec::with_capacity(manifest.len());

        for ((result, record), class) in decoded.into_iter().zip(&manifest.records).zip(indices) {
            match (result, self.policy) {
                (Ok(data), _) => {
                    pixels.extend(data);
                    labels.push(class);
                    records.push(record.clone());
                }
                (Err(err), MissingImagePolicy::Fail) => return Err(err),
                (Err(err), MissingImagePolicy::Skip) => {
                    tracing::warn!("Skipping image record {}: {}", record.index, err);
                }
            }
        }

        let pixels = Array4::from_shape_vec((labels.len(), height, width, 3), pixels)?;

        tracing::info!(
            "Encoded {} images at {}x{} over {} classes",
            labels.len(),
            width,
            height,
            label_space.len()
        );

        Ok(EncodedImages {
            pixels,
            labels,
            records,
        })
    }

    fn load_one(&self, record: &ImageRecord) -> Result<Vec<f64>> {
        let img = image::open(&record.path)
            .map_err(|e| PipelineError::unreadable(record.index, &record.path, e.to_string()))?;
        let rgb = img.to_rgb8();
        let (width, height) = self.target_size;
        let resized = image::imageops::resize(&rgb, width, height, self.filter());
        Ok(resized.into_raw().into_iter().map(f64::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn chess_dataset() -> TabularDataset {
        let rows = [
            ("1500", "1400", "white"),
            ("1400", "1500", "black"),
            ("1600", "1550", "white"),
            ("1550", "1600", "black"),
        ];
        TabularDataset {
            path: PathBuf::from("games.csv"),
            headers: vec!["white_rating".into(), "black_rating".into(), "winner".into()],
            rows: rows
                .iter()
                .map(|(w, b, r)| vec![w.to_string(), b.to_string(), r.to_string()])
                .collect(),
        }
    }

    fn chess_encoder() -> TabularEncoder {
        let mapping = [("white", 1u8), ("black", 0), ("draw", 0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        TabularEncoder::new(
            vec!["white_rating".into(), "black_rating".into()],
            DerivedDifference::default(),
            "winner".into(),
            mapping,
        )
    }

    #[test]
    fn test_chess_scenario_labels_and_difference() {
        let encoded = chess_encoder().encode(&chess_dataset()).unwrap();

        assert_eq!(encoded.labels, vec![1, 0, 1, 0]);
        let diff: Vec<f64> = encoded.features.column(2).to_vec();
        assert_eq!(diff, vec![100.0, -100.0, 50.0, -50.0]);
        assert_eq!(encoded.feature_names, vec!["white_rating", "black_rating", "rating_difference"]);
        assert_eq!(encoded.rating_pairs[0], (1500.0, 1400.0));
    }

    #[test]
    fn test_unmapped_target_value() {
        let mut ds = chess_dataset();
        ds.rows[2][2] = "resigned".to_string();
        let err = chess_encoder().encode(&ds).unwrap_err();
        match err {
            PipelineError::LabelValueUnrecognized { value, record, .. } => {
                assert_eq!(value, "resigned");
                assert_eq!(record, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_numeric_feature() {
        let mut ds = chess_dataset();
        ds.rows[1][0] = "n/a".to_string();
        let err = chess_encoder().encode(&ds).unwrap_err();
        assert!(matches!(err, PipelineError::RecordUnreadable { record: 1, .. }));
    }

    #[test]
    fn test_label_space_first_appearance_and_determinism() {
        let manifest = ["dog", "cat", "dog", "bird", "cat"];
        let a = LabelSpace::from_labels(manifest.iter().copied());
        let b = LabelSpace::from_labels(manifest.iter().copied());

        assert_eq!(a, b);
        assert_eq!(a.names(), &["dog", "cat", "bird"]);
        let idx: Vec<usize> = manifest.iter().map(|l| a.index_of(l).unwrap()).collect();
        let idx_again: Vec<usize> = manifest.iter().map(|l| b.index_of(l).unwrap()).collect();
        assert_eq!(idx, vec![0, 1, 0, 2, 1]);
        assert_eq!(idx, idx_again);
    }
}
