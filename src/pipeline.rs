// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reproducible train / persist / evaluate pipeline
//!
//! Orchestrates:
//! - Dataset ingestion and encoding for the configured variant
//! - Classifier fitting (linear SVM or transfer-learned CNN)
//! - Artifact persistence (model, preprocessor, label space, training summary)
//! - Evaluation, charts, `metrics.txt` and `results.json`
//!
//! Anything that fails after the model has been written is wrapped in
//! `PipelineError::AfterPersist` so callers know the artifacts are usable.

use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::classifiers::{argmax_rows, Classifier, TrainingSummary};
use crate::config::{EvalSubset, ImageConfig, PipelineConfig, TabularConfig, VariantConfig};
use crate::datasets::{train_test_split, ImageManifest, TabularDataset};
use crate::encoding::{EncodedImages, ImageEncoder, LabelSpace, TabularEncoder};
use crate::error::{PipelineError, Result};
use crate::metrics::EvaluationReport;
use crate::preprocessing::StandardScaler;
use crate::svm::LinearSvm;
use crate::transfer::{Backbone, TransferClassifier, TransferSettings};
use crate::visualization::{self, VisualizationArtifact};
use chrono::{DateTime, Utc};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const METRICS_FILE: &str = "metrics.txt";
pub const RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Fit, persist, then evaluate
    TrainAndEvaluate,
    /// Load persisted artifacts and evaluate only
    EvaluateOnly,
}

/// Everything written to `results.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub config: PipelineConfig,
    pub mode: Mode,
    pub model: String,
    pub model_description: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub evaluation_samples: usize,
    /// True when the evaluated records were also used for fitting
    pub evaluated_on_training_data: bool,
    pub training: TrainingSummary,
    pub report: EvaluationReport,
    pub artifacts: Vec<PathBuf>,
    pub visualizations: Vec<VisualizationArtifact>,
}

/// What a run hands back to the caller
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub mode: Mode,
    pub report: EvaluationReport,
    pub training: TrainingSummary,
    pub artifacts: Vec<PathBuf>,
    pub visualizations: Vec<VisualizationArtifact>,
    pub metrics_path: PathBuf,
    pub results_path: PathBuf,
    pub evaluation_samples: usize,
    pub evaluated_on_training_data: bool,
}

/// Evaluation data plus the variant-specific extras the report needs
struct Evaluation<'a, C: Classifier> {
    model: &'a C,
    x: &'a C::Input,
    y_true: &'a [usize],
    label_space: &'a LabelSpace,
    training: &'a TrainingSummary,
    /// Raw (minuend, subtrahend) pairs and their column names, tabular only
    scatter: Option<(&'a [(f64, f64)], (&'a str, &'a str))>,
    on_training_data: bool,
}

/// Main pipeline
pub struct Pipeline {
    config: PipelineConfig,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let store = ArtifactStore::new(&config.output_dir);
        Self { config, store }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn labels_name(&self) -> String {
        format!("{}.labels", self.config.model_name)
    }

    fn training_name(&self) -> String {
        format!("{}.training", self.config.model_name)
    }

    fn backbone_name(&self) -> String {
        format!("{}.backbone", self.config.model_name)
    }

    /// Run the pipeline for the configured variant
    pub fn run(&self, mode: Mode) -> Result<RunOutcome> {
        self.config.validate()?;
        tracing::info!(
            "Running {} pipeline ({:?}) on {}",
            self.config.variant.name(),
            mode,
            self.config.dataset.display()
        );

        match &self.config.variant {
            VariantConfig::Tabular(tabular) => match mode {
                Mode::TrainAndEvaluate => self.train_tabular(tabular),
                Mode::EvaluateOnly => self.evaluate_tabular(tabular),
            },
            VariantConfig::Image(image) => match mode {
                Mode::TrainAndEvaluate => self.train_image(image),
                Mode::EvaluateOnly => self.evaluate_image(image),
            },
        }
    }

    fn tabular_encoder(tabular: &TabularConfig) -> TabularEncoder {
        TabularEncoder::new(
            tabular.feature_columns.clone(),
            tabular.derived.clone(),
            tabular.target_column.clone(),
            tabular.label_mapping.clone(),
        )
    }

    fn train_tabular(&self, tabular: &TabularConfig) -> Result<RunOutcome> {
        let dataset = TabularDataset::load(&self.config.dataset, &tabular.required_columns())?;
        let table = Self::tabular_encoder(tabular).encode(&dataset)?;
        let label_space = LabelSpace::binary();

        let partition = train_test_split(table.labels.len(), tabular.test_fraction, tabular.seed)?;
        tracing::info!(
            "Dataset loaded: {} rows (train={}, test={})",
            table.labels.len(),
            partition.train.len(),
            partition.test.len()
        );

        let x_train = table.features.select(Axis(0), &partition.train);
        let y_train = pick(&table.labels, &partition.train);
        let scaler = StandardScaler::fit(&x_train, &table.feature_names)?;

        let mut model = LinearSvm::new(tabular.svm.clone(), tabular.seed, label_space.len());
        tracing::info!("Training {} on {} rows", model.name(), y_train.len());
        let training = model.fit(&scaler.transform(&x_train)?, &y_train)?;

        let artifacts = vec![
            self.store.save_model(&self.config.model_name, &model)?,
            self.store.save(&tabular.preprocessor_name, ArtifactKind::Preprocessor, &scaler)?,
            self.store.save(&self.labels_name(), ArtifactKind::LabelSpace, &label_space)?,
            self.store.save(&self.training_name(), ArtifactKind::TrainingSummary, &training)?,
        ];

        let x_test = self.after_persist(scaler.transform(&table.features.select(Axis(0), &partition.test)))?;
        let y_test = pick(&table.labels, &partition.test);
        let pairs = pick(&table.rating_pairs, &partition.test);
        self.after_persist(self.evaluate(
            Mode::TrainAndEvaluate,
            Evaluation {
                model: &model,
                x: &x_test,
                y_true: &y_test,
                label_space: &label_space,
                training: &training,
                scatter: Some((pairs.as_slice(), tabular.derived.columns())),
                on_training_data: false,
            },
            artifacts,
        ))
    }

    fn evaluate_tabular(&self, tabular: &TabularConfig) -> Result<RunOutcome> {
        let model: LinearSvm = self.store.load_model(&self.config.model_name)?;
        let scaler: StandardScaler = self.store.load(&tabular.preprocessor_name, ArtifactKind::Preprocessor)?;
        let label_space: LabelSpace = self.store.load(&self.labels_name(), ArtifactKind::LabelSpace)?;
        let training: TrainingSummary = self.store.load(&self.training_name(), ArtifactKind::TrainingSummary)?;

        let dataset = TabularDataset::load(&self.config.dataset, &tabular.required_columns())?;
        let table = Self::tabular_encoder(tabular).encode(&dataset)?;

        let rows: Vec<usize> = match tabular.evaluate_only_subset {
            EvalSubset::All => (0..table.labels.len()).collect(),
            EvalSubset::Test => train_test_split(table.labels.len(), tabular.test_fraction, tabular.seed)?.test,
        };
        tracing::info!("Evaluating {} of {} rows ({:?})", rows.len(), table.labels.len(), tabular.evaluate_only_subset);

        let x = scaler.transform(&table.features.select(Axis(0), &rows))?;
        let y = pick(&table.labels, &rows);
        let pairs = pick(&table.rating_pairs, &rows);
        let artifacts = self.existing_artifacts(&[
            self.config.model_name.as_str(),
            tabular.preprocessor_name.as_str(),
            self.labels_name().as_str(),
            self.training_name().as_str(),
        ]);

        self.evaluate(
            Mode::EvaluateOnly,
            Evaluation {
                model: &model,
                x: &x,
                y_true: &y,
                label_space: &label_space,
                training: &training,
                scatter: Some((pairs.as_slice(), tabular.derived.columns())),
                on_training_data: tabular.evaluate_only_subset == EvalSubset::All,
            },
            artifacts,
        )
    }

    fn load_images(&self, image: &ImageConfig, label_space: Option<&LabelSpace>) -> Result<(LabelSpace, EncodedImages)> {
        let manifest = ImageManifest::load(
            &image.manifest_path(&self.config.dataset),
            &image.image_dir_path(&self.config.dataset),
            image.missing_images,
        )?;
        // Derived once from the full manifest, before any decoding
        let label_space = match label_space {
            Some(persisted) => persisted.clone(),
            None => LabelSpace::from_labels(manifest.labels()),
        };
        tracing::info!(
            "Manifest loaded: {} records, {} classes, {} skipped",
            manifest.len(),
            label_space.len(),
            manifest.skipped.len()
        );

        let encoder = ImageEncoder::new(image.target_size, image.resample, image.missing_images);
        let encoded = with_workers(image.workers, || encoder.encode(&manifest, &label_space))?;
        Ok((label_space, encoded))
    }

    fn train_image(&self, image: &ImageConfig) -> Result<RunOutcome> {
        let (label_space, encoded) = self.load_images(image, None)?;

        let (train, held_out) = match image.holdout_fraction {
            Some(fraction) => {
                let partition = train_test_split(encoded.len(), fraction, image.seed)?;
                (encoded.select(&partition.train), Some(encoded.select(&partition.test)))
            }
            None => {
                tracing::warn!("No holdout configured; evaluation reuses the training images");
                (encoded, None)
            }
        };

        let (backbone, settings) = prepare_backbone(image)?;
        let mut model = TransferClassifier::new(backbone, label_space.len(), settings);
        tracing::info!("Training {} on {} images", model.name(), train.len());
        let training = model.fit(&train.pixels, &train.labels)?;

        let artifacts = vec![
            self.store.save_model(&self.config.model_name, &model)?,
            self.store.save(&self.labels_name(), ArtifactKind::LabelSpace, &label_space)?,
            self.store.save(&self.training_name(), ArtifactKind::TrainingSummary, &training)?,
            self.store.save(&self.backbone_name(), ArtifactKind::Backbone, &model.backbone())?,
        ];

        let eval = held_out.as_ref().unwrap_or(&train);
        self.after_persist(self.evaluate(
            Mode::TrainAndEvaluate,
            Evaluation {
                model: &model,
                x: &eval.pixels,
                y_true: &eval.labels,
                label_space: &label_space,
                training: &training,
                scatter: None,
                on_training_data: held_out.is_none(),
            },
            artifacts,
        ))
    }

    fn evaluate_image(&self, image: &ImageConfig) -> Result<RunOutcome> {
        let model: TransferClassifier = self.store.load_model(&self.config.model_name)?;
        let label_space: LabelSpace = self.store.load(&self.labels_name(), ArtifactKind::LabelSpace)?;
        let training: TrainingSummary = self.store.load(&self.training_name(), ArtifactKind::TrainingSummary)?;

        let (label_space, encoded) = self.load_images(image, Some(&label_space))?;
        let eval = match image.holdout_fraction {
            Some(fraction) => encoded.select(&train_test_split(encoded.len(), fraction, image.seed)?.test),
            None => encoded,
        };
        let artifacts = self.existing_artifacts(&[
            self.config.model_name.as_str(),
            self.labels_name().as_str(),
            self.training_name().as_str(),
            self.backbone_name().as_str(),
        ]);

        self.evaluate(
            Mode::EvaluateOnly,
            Evaluation {
                model: &model,
                x: &eval.pixels,
                y_true: &eval.labels,
                label_space: &label_space,
                training: &training,
                scatter: None,
                on_training_data: image.holdout_fraction.is_none(),
            },
            artifacts,
        )
    }

    fn existing_artifacts(&self, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .filter_map(|name| self.store.path_for(name).ok())
            .filter(|path| path.is_file())
            .collect()
    }

    fn after_persist<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|source| PipelineError::AfterPersist {
            model: self.config.model_name.clone(),
            source: Box::new(source),
        })
    }

    /// Shared predict -> report -> charts -> files stage
    fn evaluate<C: Classifier>(&self, mode: Mode, eval: Evaluation<'_, C>, artifacts: Vec<PathBuf>) -> Result<RunOutcome> {
        let scores = eval.model.predict_scores(eval.x)?;
        let y_pred = argmax_rows(&scores);
        let report = EvaluationReport::compute(eval.label_space, eval.y_true, &y_pred, &scores)?;

        tracing::info!(
            "  {} - Accuracy: {:.4}, Macro F1: {:.4} on {} samples",
            eval.model.name(),
            report.accuracy,
            report.macro_avg.f1_score,
            report.n_samples
        );
        if let Some(positive) = report.binary_summary() {
            tracing::info!(
                "  positive class '{}' - Precision: {:.4}, Recall: {:.4}, F1: {:.4}",
                positive.label,
                positive.precision,
                positive.recall,
                positive.f1_score
            );
        }

        let out = &self.config.output_dir;
        fs::create_dir_all(out).map_err(|e| PipelineError::io(out, e))?;

        let mut visualizations = vec![
            visualization::render_confusion_matrix(&report, &out.join(visualization::CONFUSION_MATRIX_FILE))?,
            visualization::render_roc_curves(&report, &out.join(visualization::ROC_CURVE_FILE))?,
            visualization::render_pr_curves(&report, &out.join(visualization::PR_CURVE_FILE))?,
        ];
        if let Some((pairs, axis_names)) = eval.scatter {
            visualizations.push(visualization::render_rating_scatter(
                pairs,
                &y_pred,
                eval.label_space.names(),
                axis_names,
                &out.join(visualization::RATING_SCATTER_FILE),
            )?);
        }
        let image_variant = matches!(self.config.variant, VariantConfig::Image(_));
        if mode == Mode::TrainAndEvaluate && image_variant && !eval.training.history.is_empty() {
            visualizations.push(visualization::render_training_history(
                &eval.training.history,
                &out.join(visualization::TRAINING_HISTORY_FILE),
            )?);
        }

        let metrics_path = out.join(METRICS_FILE);
        let metrics = Self::metrics_text(&self.config.variant, &report, eval.training);
        fs::write(&metrics_path, metrics).map_err(|e| PipelineError::RenderFailed {
            path: metrics_path.clone(),
            reason: e.to_string(),
        })?;

        let results = RunResults {
            config: self.config.clone(),
            mode,
            model: eval.model.name().to_string(),
            model_description: eval.model.description().to_string(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            evaluation_samples: report.n_samples,
            evaluated_on_training_data: eval.on_training_data,
            training: eval.training.clone(),
            report: report.clone(),
            artifacts: artifacts.clone(),
            visualizations: visualizations.clone(),
        };
        let results_path = out.join(RESULTS_FILE);
        Self::save_results(&results, &results_path)?;

        Ok(RunOutcome {
            mode,
            evaluation_samples: report.n_samples,
            report,
            training: eval.training.clone(),
            artifacts,
            visualizations,
            metrics_path,
            results_path,
            evaluated_on_training_data: eval.on_training_data,
        })
    }

    /// `metrics.txt` body for the given variant
    pub fn metrics_text(variant: &VariantConfig, report: &EvaluationReport, training: &TrainingSummary) -> String {
        let mut text = String::new();
        match variant {
            VariantConfig::Tabular(_) => {
                text.push_str(&format!("Accuracy: {:?}\n", report.accuracy));
            }
            VariantConfig::Image(_) => {
                text.push_str(&format!("Final Accuracy: {:.4}\n", training.final_accuracy));
                text.push_str(&format!("Final Loss: {:.4}\n\n", training.final_loss));
            }
        }
        text.push_str("Classification Report:\n");
        text.push_str(&report.classification_report());
        text
    }

    /// Save results to JSON file
    pub fn save_results(results: &RunResults, output_path: &Path) -> Result<()> {
        let render_failed = |reason: String| PipelineError::RenderFailed {
            path: output_path.to_path_buf(),
            reason,
        };
        let json = serde_json::to_string_pretty(results).map_err(|e| render_failed(e.to_string()))?;
        fs::write(output_path, json).map_err(|e| render_failed(e.to_string()))?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }
}

/// Pretrained extractor with the configured fine-tuning depth, or a seeded
/// one that trains end to end
fn prepare_backbone(image: &ImageConfig) -> Result<(Backbone, TransferSettings)> {
    let mut settings = TransferSettings::from(image);
    let backbone = match &image.backbone.weights {
        Some(path) => {
            let backbone: Backbone = ArtifactStore::load_path(path, ArtifactKind::Backbone)?;
            backbone.check_input(image.target_size)?;
            tracing::info!("Loaded pretrained backbone from {}", path.display());
            backbone
        }
        None => {
            let backbone = Backbone::initialise(&image.backbone, image.target_size, image.seed);
            tracing::warn!(
                "No pretrained backbone weights configured; initialising from seed {} and training all {} layers",
                image.seed,
                backbone.n_layers()
            );
            settings.unfrozen_layers = backbone.n_layers();
            backbone
        }
    };
    Ok((backbone, settings))
}

fn pick<T: Clone>(values: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| values[i].clone()).collect()
}

/// Run `job` on a dedicated rayon pool when a worker count is configured
fn with_workers<T, F>(workers: Option<usize>, job: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    match workers {
        None => job(),
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| PipelineError::Config(format!("cannot build a {}-thread pool: {}", threads, e)))?;
            pool.install(job)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TabularConfig;
    use ndarray::array;
    use tempfile::TempDir;

    fn write_games(dir: &Path) -> PathBuf {
        let mut csv = String::from("id,white_rating,black_rating,winner\n");
        for i in 0..40 {
            let diff = (i as f64 - 20.0) * 10.0 + 5.0;
            let winner = if diff > 0.0 { "white" } else if i % 2 == 0 { "black" } else { "draw" };
            csv.push_str(&format!("g{},{},{},{}\n", i, 1500.0 + diff, 1500.0, winner));
        }
        let path = dir.join("games.csv");
        fs::write(&path, csv).unwrap();
        path
    }

    fn tabular_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            dataset: write_games(dir),
            output_dir: dir.join("out"),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_tabular_metrics_text() {
        let report = EvaluationReport::compute(
            &LabelSpace::binary(),
            &[1, 0],
            &[1, 0],
            &array![[-1.0, 1.0], [1.0, -1.0]],
        )
        .unwrap();
        let training = TrainingSummary::from_history(vec![], 2);
        let text = Pipeline::metrics_text(&VariantConfig::Tabular(TabularConfig::default()), &report, &training);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Accuracy: 1.0");
        assert_eq!(lines[1], "Classification Report:");

        let report = EvaluationReport::compute(
            &LabelSpace::binary(),
            &[1, 0, 1, 1],
            &[1, 0, 0, 1],
            &array![[-1.0, 1.0], [1.0, -1.0], [0.5, -0.5], [-2.0, 2.0]],
        )
        .unwrap();
        let text = Pipeline::metrics_text(&VariantConfig::Tabular(TabularConfig::default()), &report, &training);
        assert!(text.starts_with("Accuracy: 0.75\n"));
    }

    #[test]
    fn test_image_metrics_text() {
        let report = EvaluationReport::compute(
            &LabelSpace::from_labels(["cat", "dog"]),
            &[0],
            &[0],
            &array![[0.9, 0.1]],
        )
        .unwrap();
        let training = TrainingSummary {
            final_accuracy: 0.5,
            final_loss: 0.69314,
            history: vec![],
            training_samples: 1,
        };
        let image = VariantConfig::Image(ImageConfig::default());
        let text = Pipeline::metrics_text(&image, &report, &training);
        assert!(text.starts_with("Final Accuracy: 0.5000\nFinal Loss: 0.6931\n\nClassification Report:\n"));
    }

    #[test]
    fn test_tabular_train_persists_all_artifacts() {
        let dir = TempDir::new().unwrap();
        let config = tabular_config(dir.path());
        let outcome = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap();

        let out = &config.output_dir;
        for name in ["svm_model.bin", "scaler.bin", "svm_model.labels.bin", "svm_model.training.bin"] {
            assert!(out.join(name).is_file(), "missing {}", name);
        }
        assert_eq!(outcome.artifacts.len(), 4);
        // ceil(40 * 0.3)
        assert_eq!(outcome.evaluation_samples, 12);
        assert!(!outcome.evaluated_on_training_data);
        let metrics = fs::read_to_string(&outcome.metrics_path).unwrap();
        assert!(metrics.starts_with("Accuracy: "));
        assert_eq!(outcome.visualizations.len(), 4);
    }

    #[test]
    fn test_unrecognized_outcome_aborts_before_persisting() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("games.csv");
        fs::write(&data, "white_rating,black_rating,winner\n1500,1400,white\n1400,1500,resigned\n").unwrap();
        let config = PipelineConfig {
            dataset: data,
            output_dir: dir.path().join("out"),
            ..PipelineConfig::default()
        };

        let err = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap_err();
        assert!(matches!(err, PipelineError::LabelValueUnrecognized { ref value, .. } if value == "resigned"));
        assert!(!config.output_dir.join("svm_model.bin").exists());
    }

    #[test]
    fn test_render_failure_after_persist_is_wrapped() {
        let dir = TempDir::new().unwrap();
        let config = tabular_config(dir.path());
        fs::create_dir_all(&config.output_dir).unwrap();
        // A directory where the chart file should go makes the write fail
        fs::create_dir_all(config.output_dir.join(visualization::ROC_CURVE_FILE)).unwrap();

        let err = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap_err();
        assert!(err.model_was_persisted());
        assert!(config.output_dir.join("svm_model.bin").is_file());
    }

    #[test]
    fn test_seeded_backbone_trains_every_layer() {
        let image = ImageConfig {
            target_size: (8, 8),
            unfrozen_layers: 1,
            ..ImageConfig::default()
        };
        let (backbone, settings) = prepare_backbone(&image).unwrap();
        assert_eq!(backbone.n_layers(), 3);
        assert_eq!(settings.unfrozen_layers, 3);
    }

    #[test]
    fn test_pretrained_backbone_keeps_configured_depth() {
        let dir = TempDir::new().unwrap();
        let mut image = ImageConfig {
            target_size: (8, 8),
            unfrozen_layers: 1,
            ..ImageConfig::default()
        };
        let weights = Backbone::initialise(&image.backbone, image.target_size, 3);
        let path = ArtifactStore::new(dir.path())
            .save("pretrained", ArtifactKind::Backbone, &weights)
            .unwrap();
        image.backbone.weights = Some(path);

        let (_, settings) = prepare_backbone(&image).unwrap();
        assert_eq!(settings.unfrozen_layers, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PipelineConfig {
            model_name: " ".to_string(),
            ..PipelineConfig::default()
        };
        let err = Pipeline::new(config).run(Mode::EvaluateOnly).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
