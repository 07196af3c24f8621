// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Train, persist and evaluate classifiers as one batch job
//!
//! This crate provides:
//! - Dataset ingestion (delimited tables, image manifests) and seeded splits
//! - Feature encoding with a persisted label space
//! - Two classifiers behind one trait: a linear SVM and a transfer-learned CNN
//! - Checksummed artifact persistence
//! - Evaluation metrics (accuracy, precision, recall, F1, ROC/AUC, PR/AP)
//! - SVG charts and text/JSON reports

pub mod artifacts;
pub mod classifiers;
pub mod config;
pub mod datasets;
pub mod encoding;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod preprocessing;
pub mod svm;
pub mod transfer;
pub mod visualization;

pub use artifacts::{ArtifactKind, ArtifactStore};
pub use classifiers::{Classifier, EpochStats, TrainingSummary};
pub use config::{EvalSubset, ImageConfig, MissingImagePolicy, PipelineConfig, TabularConfig, VariantConfig};
pub use datasets::{train_test_split, ImageManifest, Partition, TabularDataset};
pub use encoding::{ImageEncoder, LabelSpace, TabularEncoder};
pub use error::{PipelineError, Result};
pub use metrics::{ConfusionMatrix, EvaluationReport};
pub use pipeline::{Mode, Pipeline, RunOutcome, RunResults};
pub use preprocessing::StandardScaler;
pub use svm::LinearSvm;
pub use transfer::{Backbone, TransferClassifier};
pub use visualization::VisualizationArtifact;
