// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Pipeline configuration
//!
//! Every field has a default so a configuration file only needs to name
//! what differs. Relative image paths are resolved against the dataset
//! directory, never against the process working directory.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tabular: the delimited data file. Image: the dataset directory.
    pub dataset: PathBuf,
    /// Directory receiving artifacts, metrics and plots
    pub output_dir: PathBuf,
    /// Name the fitted model is persisted under
    pub model_name: String,
    pub variant: VariantConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: PathBuf::from("games.csv"),
            output_dir: PathBuf::from("output"),
            model_name: "svm_model".to_string(),
            variant: VariantConfig::Tabular(TabularConfig::default()),
        }
    }
}

/// Which trainer the pipeline instantiates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariantConfig {
    Tabular(TabularConfig),
    Image(ImageConfig),
}

impl VariantConfig {
    pub fn name(&self) -> &'static str {
        match self {
            VariantConfig::Tabular(_) => "tabular",
            VariantConfig::Image(_) => "image",
        }
    }
}

/// The two rating columns whose difference becomes a derived feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedDifference {
    pub name: String,
    pub minuend: String,
    pub subtrahend: String,
}

impl DerivedDifference {
    /// (minuend, subtrahend) column names
    pub fn columns(&self) -> (&str, &str) {
        (&self.minuend, &self.subtrahend)
    }
}

impl Default for DerivedDifference {
    fn default() -> Self {
        Self {
            name: "rating_difference".to_string(),
            minuend: "white_rating".to_string(),
            subtrahend: "black_rating".to_string(),
        }
    }
}

/// Which rows an evaluate-only tabular run scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalSubset {
    /// Every row of the dataset
    All,
    /// The held-out partition reproduced from the configured seed
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmConfig {
    /// Soft-margin penalty
    pub c: f64,
    pub tol: f64,
    pub max_iter: usize,
    /// Consecutive passes without an update before SMO stops
    pub max_passes: usize,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            tol: 1e-3,
            max_iter: 1000,
            max_passes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularConfig {
    /// Numeric columns used as-is
    pub feature_columns: Vec<String>,
    pub derived: DerivedDifference,
    pub target_column: String,
    /// Explicit outcome value to class mapping, 1 = positive class
    pub label_mapping: BTreeMap<String, u8>,
    pub test_fraction: f64,
    pub seed: u64,
    pub preprocessor_name: String,
    pub svm: SvmConfig,
    pub evaluate_only_subset: EvalSubset,
}

impl Default for TabularConfig {
    fn default() -> Self {
        let label_mapping = [("white", 1u8), ("black", 0), ("draw", 0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            feature_columns: vec!["white_rating".to_string(), "black_rating".to_string()],
            derived: DerivedDifference::default(),
            target_column: "winner".to_string(),
            label_mapping,
            test_fraction: 0.3,
            seed: 42,
            preprocessor_name: "scaler".to_string(),
            svm: SvmConfig::default(),
            evaluate_only_subset: EvalSubset::All,
        }
    }
}

impl TabularConfig {
    /// Every column the data file must carry
    pub fn required_columns(&self) -> Vec<String> {
        let mut columns = self.feature_columns.clone();
        for extra in [&self.derived.minuend, &self.derived.subtrahend, &self.target_column] {
            if !columns.contains(extra) {
                columns.push(extra.clone());
            }
        }
        columns
    }
}

/// Resampling filter used when resizing images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplePolicy {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos3,
}

/// What to do with a manifest record whose image cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingImagePolicy {
    /// Abort the run on the first unreadable record
    Fail,
    /// Drop the record and log a warning
    Skip,
}

/// Shape of the convolutional feature extractor and the replacement head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub conv_filters: usize,
    /// Average pooling grid (grid x grid cells) after the convolution
    pub pool_grid: usize,
    /// Widths of the dense blocks that follow the convolution
    pub block_widths: Vec<usize>,
    pub head_units: usize,
    /// Pretrained backbone weights persisted by `ArtifactStore`
    pub weights: Option<PathBuf>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            conv_filters: 16,
            pool_grid: 4,
            block_widths: vec![128, 128],
            head_units: 256,
            weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Manifest with `filename` and `label` columns
    pub manifest: PathBuf,
    pub image_dir: PathBuf,
    /// (width, height)
    pub target_size: (u32, u32),
    pub resample: ResamplePolicy,
    pub batch_size: usize,
    pub epochs: usize,
    /// Terminal layers of a pretrained backbone left trainable; a seeded
    /// backbone always trains every layer
    pub unfrozen_layers: usize,
    pub learning_rate: f64,
    pub seed: u64,
    /// Fraction held out for evaluation; `None` evaluates on the training data
    pub holdout_fraction: Option<f64>,
    pub missing_images: MissingImagePolicy,
    /// Decoder threads; `None` uses the global rayon pool
    pub workers: Option<usize>,
    pub backbone: BackboneConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("Training_set.csv"),
            image_dir: PathBuf::from("train"),
            target_size: (32, 32),
            resample: ResamplePolicy::Nearest,
            batch_size: 8,
            epochs: 3,
            unfrozen_layers: 2,
            learning_rate: 1e-3,
            seed: 42,
            holdout_fraction: None,
            missing_images: MissingImagePolicy::Fail,
            workers: None,
            backbone: BackboneConfig::default(),
        }
    }
}

impl ImageConfig {
    pub fn manifest_path(&self, dataset: &Path) -> PathBuf {
        resolve(dataset, &self.manifest)
    }

    pub fn image_dir_path(&self, dataset: &Path) -> PathBuf {
        resolve(dataset, &self.image_dir)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl PipelineConfig {
    /// Default configuration for the image variant
    pub fn image_defaults() -> Self {
        Self {
            dataset: PathBuf::from("datasets"),
            output_dir: PathBuf::from("output"),
            model_name: "trained_model".to_string(),
            variant: VariantConfig::Image(ImageConfig::default()),
        }
    }

    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(PipelineError::Config("model_name must not be empty".to_string()));
        }
        match &self.variant {
            VariantConfig::Tabular(tabular) => {
                if tabular.label_mapping.is_empty() {
                    return Err(PipelineError::Config("label_mapping must not be empty".to_string()));
                }
                if let Some((value, class)) = tabular.label_mapping.iter().find(|(_, v)| **v > 1) {
                    return Err(PipelineError::Config(format!(
                        "label_mapping maps '{}' to {}, only 0 and 1 are allowed",
                        value, class
                    )));
                }
                if !tabular.label_mapping.values().any(|v| *v == 1) {
                    return Err(PipelineError::Config(
                        "label_mapping needs at least one value mapped to the positive class".to_string(),
                    ));
                }
                check_fraction("test_fraction", tabular.test_fraction)?;
                if tabular.preprocessor_name == self.model_name {
                    return Err(PipelineError::Config(
                        "preprocessor_name must differ from model_name".to_string(),
                    ));
                }
                if tabular.svm.c <= 0.0 {
                    return Err(PipelineError::Config("svm.c must be positive".to_string()));
                }
            }
            VariantConfig::Image(image) => {
                if image.target_size.0 == 0 || image.target_size.1 == 0 {
                    return Err(PipelineError::Config("target_size must be non-zero".to_string()));
                }
                if image.batch_size == 0 || image.epochs == 0 {
                    return Err(PipelineError::Config(
                        "batch_size and epochs must be at least 1".to_string(),
                    ));
                }
                if let Some(fraction) = image.holdout_fraction {
                    check_fraction("holdout_fraction", fraction)?;
                }
                let backbone = &image.backbone;
                if backbone.conv_filters == 0 || backbone.head_units == 0 || backbone.pool_grid == 0 {
                    return Err(PipelineError::Config(
                        "backbone conv_filters, pool_grid and head_units must be non-zero".to_string(),
                    ));
                }
                if backbone.pool_grid > image.target_size.0.min(image.target_size.1) as usize {
                    return Err(PipelineError::Config(format!(
                        "pool_grid {} exceeds the image size {:?}",
                        backbone.pool_grid, image.target_size
                    )));
                }
                if image.learning_rate <= 0.0 {
                    return Err(PipelineError::Config("learning_rate must be positive".to_string()));
                }
            }
        }
        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("{} must be in (0, 1), got {}", name, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        PipelineConfig::default().validate().unwrap();
        PipelineConfig::image_defaults().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "dataset": "data/games.csv",
            "variant": { "kind": "tabular", "test_fraction": 0.25 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model_name, "svm_model");
        match config.variant {
            VariantConfig::Tabular(t) => {
                assert!((t.test_fraction - 0.25).abs() < 1e-12);
                assert_eq!(t.target_column, "winner");
                assert_eq!(t.label_mapping.get("white"), Some(&1));
            }
            VariantConfig::Image(_) => panic!("expected tabular variant"),
        }
    }

    #[test]
    fn test_image_json() {
        let json = r#"{
            "dataset": "datasets/ds2",
            "model_name": "trained_model",
            "variant": { "kind": "image", "target_size": [64, 48], "resample": "bilinear", "holdout_fraction": 0.2 }
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        match config.variant {
            VariantConfig::Image(i) => {
                assert_eq!(i.target_size, (64, 48));
                assert_eq!(i.resample, ResamplePolicy::Bilinear);
                assert_eq!(i.holdout_fraction, Some(0.2));
                assert_eq!(
                    i.manifest_path(Path::new("datasets/ds2")),
                    PathBuf::from("datasets/ds2/Training_set.csv")
                );
            }
            VariantConfig::Tabular(_) => panic!("expected image variant"),
        }
    }

    #[test]
    fn test_rejects_non_binary_mapping() {
        let mut tabular = TabularConfig::default();
        tabular.label_mapping.insert("draw".to_string(), 2);
        let config = PipelineConfig {
            variant: VariantConfig::Tabular(tabular),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_fraction() {
        let tabular = TabularConfig {
            test_fraction: 1.0,
            ..TabularConfig::default()
        };
        let config = PipelineConfig {
            variant: VariantConfig::Tabular(tabular),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_columns_deduplicated() {
        let columns = TabularConfig::default().required_columns();
        assert_eq!(columns, vec!["white_rating", "black_rating", "winner"]);
    }
}
