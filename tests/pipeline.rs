// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

use classify_pipeline::config::{BackboneConfig, EvalSubset, ImageConfig, PipelineConfig, SvmConfig, VariantConfig};
use classify_pipeline::transfer::TransferSettings;
use classify_pipeline::{
    ArtifactKind, ArtifactStore, Backbone, Classifier, LabelSpace, LinearSvm, Mode, Pipeline, PipelineError,
    RunResults, StandardScaler, TransferClassifier,
};
use image::{Rgb, RgbImage};
use ndarray::{array, Array4, Axis};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Games where white wins whenever it is the higher-rated side
fn write_games(dir: &Path, n: usize) -> PathBuf {
    let mut csv = String::from("id,rated,white_rating,black_rating,winner\n");
    for i in 0..n {
        let white = 1200 + (i * 37) % 600;
        let black = 1200 + (i * 53) % 600;
        let winner = if white > black {
            "white"
        } else if i % 3 == 0 {
            "draw"
        } else {
            "black"
        };
        csv.push_str(&format!("g{},TRUE,{},{},{}\n", i, white, black, winner));
    }
    let path = dir.join("games.csv");
    fs::write(&path, csv).unwrap();
    path
}

fn tabular_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        dataset: write_games(dir, 60),
        output_dir: dir.join("output"),
        ..PipelineConfig::default()
    }
}

/// Dataset directory with `train/` and `Training_set.csv`; red vs blue squares
fn write_image_dataset(dir: &Path, per_class: usize) -> PathBuf {
    let dataset = dir.join("datasets");
    let train = dataset.join("train");
    fs::create_dir_all(&train).unwrap();

    let mut manifest = String::from("filename,label\n");
    for i in 0..per_class {
        for (label, color) in [("red", Rgb([220u8, 30, 30])), ("blue", Rgb([30u8, 30, 220]))] {
            let name = format!("{}_{}.png", label, i);
            let shade = (i * 7) as u8;
            let Rgb([r, g, b]) = color;
            RgbImage::from_pixel(12, 10, Rgb([r.saturating_sub(shade), g, b.saturating_sub(shade)]))
                .save(train.join(&name))
                .unwrap();
            manifest.push_str(&format!("{},{}\n", name, label));
        }
    }
    fs::write(dataset.join("Training_set.csv"), manifest).unwrap();
    dataset
}

fn small_image_config() -> ImageConfig {
    ImageConfig {
        target_size: (8, 8),
        batch_size: 4,
        epochs: 2,
        workers: Some(2),
        backbone: BackboneConfig {
            conv_filters: 4,
            pool_grid: 2,
            block_widths: vec![8],
            head_units: 8,
            weights: None,
        },
        ..ImageConfig::default()
    }
}

fn image_config(dir: &Path, image: ImageConfig) -> PipelineConfig {
    PipelineConfig {
        dataset: write_image_dataset(dir, 4),
        output_dir: dir.join("output"),
        variant: VariantConfig::Image(image),
        ..PipelineConfig::image_defaults()
    }
}

#[test]
fn tabular_train_then_evaluate_only() {
    let dir = TempDir::new().unwrap();
    let mut config = tabular_config(dir.path());

    let trained = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap();
    let out = &config.output_dir;
    for file in [
        "confusion_matrix.svg",
        "roc_curve.svg",
        "precision_recall_curve.svg",
        "rating_scatter_plot.svg",
        "metrics.txt",
        "results.json",
    ] {
        assert!(out.join(file).is_file(), "missing {}", file);
    }
    assert!(!out.join("training_history.svg").exists());
    assert_eq!(trained.evaluation_samples, 18);

    // Whole dataset by default
    let all = Pipeline::new(config.clone()).run(Mode::EvaluateOnly).unwrap();
    assert_eq!(all.evaluation_samples, 60);
    assert!(all.evaluated_on_training_data);
    assert_eq!(all.training, trained.training);

    // The seeded test partition reproduces the training run's report
    if let VariantConfig::Tabular(tabular) = &mut config.variant {
        tabular.evaluate_only_subset = EvalSubset::Test;
    }
    let test = Pipeline::new(config).run(Mode::EvaluateOnly).unwrap();
    assert_eq!(test.report.confusion_matrix, trained.report.confusion_matrix);
    assert_eq!(test.report.accuracy, trained.report.accuracy);
}

#[test]
fn persisted_svm_scores_match_the_fitted_model() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());

    let x = array![[2.0, 1.5], [1.2, 0.8], [1.8, 2.2], [-1.0, -1.4], [-2.1, -0.7], [-0.9, -2.0]];
    let y = vec![1, 1, 1, 0, 0, 0];
    let mut model = LinearSvm::new(SvmConfig::default(), 42, 2);
    model.fit(&x, &y).unwrap();

    store.save_model("svm_model", &model).unwrap();
    let loaded: LinearSvm = store.load_model("svm_model").unwrap();

    let unseen = array![[0.3, 0.1], [-0.4, 0.2], [3.0, -1.0]];
    assert_eq!(loaded.predict_scores(&unseen).unwrap(), model.predict_scores(&unseen).unwrap());
    assert_eq!(loaded.predict(&x).unwrap(), model.predict(&x).unwrap());
}

#[test]
fn persisted_transfer_model_scores_match_the_fitted_model() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path());
    let image = small_image_config();

    let mut x = Array4::zeros((6, 8, 8, 3));
    let mut y = Vec::new();
    for i in 0..6 {
        let level = if i % 2 == 0 { 25.0 } else { 225.0 };
        x.index_axis_mut(Axis(0), i).fill(level);
        y.push(i % 2);
    }
    let backbone = Backbone::initialise(&image.backbone, image.target_size, 5);
    let mut model = TransferClassifier::new(backbone, 2, TransferSettings::from(&image));
    model.fit(&x, &y).unwrap();

    store.save_model("trained_model", &model).unwrap();
    let loaded: TransferClassifier = store.load_model("trained_model").unwrap();
    assert_eq!(loaded.predict_scores(&x).unwrap(), model.predict_scores(&x).unwrap());
}

#[test]
fn persisted_tabular_artifacts_reload() {
    let dir = TempDir::new().unwrap();
    let config = tabular_config(dir.path());
    Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap();

    let store = ArtifactStore::new(&config.output_dir);
    let model: LinearSvm = store.load_model("svm_model").unwrap();
    let scaler: StandardScaler = store.load("scaler", ArtifactKind::Preprocessor).unwrap();
    let labels: LabelSpace = store.load("svm_model.labels", ArtifactKind::LabelSpace).unwrap();
    assert_eq!(labels, LabelSpace::binary());

    let x = scaler
        .transform(&array![[1700.0, 1300.0, 400.0], [1250.0, 1750.0, -500.0]])
        .unwrap();
    assert_eq!(model.predict(&x).unwrap(), vec![1, 0]);
}

#[test]
fn results_json_describes_the_run() {
    let dir = TempDir::new().unwrap();
    let config = tabular_config(dir.path());
    let outcome = Pipeline::new(config).run(Mode::TrainAndEvaluate).unwrap();

    let json = fs::read_to_string(&outcome.results_path).unwrap();
    let results: RunResults = serde_json::from_str(&json).unwrap();
    assert_eq!(results.mode, Mode::TrainAndEvaluate);
    assert_eq!(results.model, "LinearSVM");
    assert_eq!(results.artifacts.len(), 4);
    assert_eq!(results.report.n_samples, outcome.evaluation_samples);
}

#[test]
fn evaluate_only_without_artifacts_fails() {
    let dir = TempDir::new().unwrap();
    let config = tabular_config(dir.path());

    let err = Pipeline::new(config).run(Mode::EvaluateOnly).unwrap_err();
    match err {
        PipelineError::ArtifactNotFound { name, .. } => assert_eq!(name, "svm_model"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_dataset_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        dataset: dir.path().join("nope.csv"),
        output_dir: dir.path().join("output"),
        ..PipelineConfig::default()
    };
    let err = Pipeline::new(config).run(Mode::TrainAndEvaluate).unwrap_err();
    assert!(matches!(err, PipelineError::DatasetNotFound { .. }));
    assert!(err.to_string().contains("nope.csv"));
}

#[test]
fn image_training_evaluates_on_training_images_without_holdout() {
    let dir = TempDir::new().unwrap();
    let config = image_config(dir.path(), small_image_config());

    let outcome = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap();

    // Expected but optimistic: every training image is also an evaluation image
    assert!(outcome.evaluated_on_training_data);
    assert_eq!(outcome.evaluation_samples, 8);
    assert_eq!(outcome.training.training_samples, 8);
    assert_eq!(outcome.training.history.len(), 2);
    assert_eq!(outcome.report.labels, vec!["red".to_string(), "blue".to_string()]);

    let out = &config.output_dir;
    for file in [
        "trained_model.bin",
        "trained_model.labels.bin",
        "trained_model.backbone.bin",
        "training_history.svg",
    ] {
        assert!(out.join(file).is_file(), "missing {}", file);
    }
    assert!(!out.join("rating_scatter_plot.svg").exists());

    let metrics = fs::read_to_string(&outcome.metrics_path).unwrap();
    let lines: Vec<&str> = metrics.lines().collect();
    assert!(lines[0].starts_with("Final Accuracy: "));
    assert!(lines[1].starts_with("Final Loss: "));
    assert_eq!(lines[2], "");
    assert_eq!(lines[3], "Classification Report:");
}

#[test]
fn fine_tuned_backbone_is_reusable_as_pretrained_weights() {
    let dir = TempDir::new().unwrap();
    let config = image_config(dir.path(), small_image_config());
    let first = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap();
    let backbone_path = config.output_dir.join("trained_model.backbone.bin");
    assert!(first.artifacts.contains(&backbone_path));

    // Without pretrained weights the whole extractor is fine-tuned
    let store = ArtifactStore::new(&config.output_dir);
    let model: TransferClassifier = store.load_model("trained_model").unwrap();
    assert_eq!(model.first_trainable_layer(), 0);

    let image = ImageConfig {
        unfrozen_layers: 1,
        backbone: BackboneConfig {
            weights: Some(backbone_path),
            ..small_image_config().backbone
        },
        ..small_image_config()
    };
    let second = PipelineConfig {
        variant: VariantConfig::Image(image),
        output_dir: dir.path().join("output_second"),
        ..config
    };
    Pipeline::new(second.clone()).run(Mode::TrainAndEvaluate).unwrap();
    let model: TransferClassifier = ArtifactStore::new(&second.output_dir).load_model("trained_model").unwrap();
    assert_eq!(model.settings().unfrozen_layers, 1);
    assert_eq!(model.first_trainable_layer(), 1);
}

#[test]
fn image_holdout_is_opt_in() {
    let dir = TempDir::new().unwrap();
    let image = ImageConfig {
        holdout_fraction: Some(0.25),
        ..small_image_config()
    };
    let config = image_config(dir.path(), image);

    let trained = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap();
    assert!(!trained.evaluated_on_training_data);
    assert_eq!(trained.evaluation_samples, 2);
    assert_eq!(trained.training.training_samples, 6);

    let evaluated = Pipeline::new(config).run(Mode::EvaluateOnly).unwrap();
    assert_eq!(evaluated.report.confusion_matrix, trained.report.confusion_matrix);
}

#[test]
fn missing_image_aborts_before_any_artifact() {
    let dir = TempDir::new().unwrap();
    let config = image_config(dir.path(), small_image_config());
    fs::remove_file(config.dataset.join("train").join("blue_2.png")).unwrap();

    let err = Pipeline::new(config.clone()).run(Mode::TrainAndEvaluate).unwrap_err();
    assert!(matches!(err, PipelineError::RecordUnreadable { .. }));
    assert!(!err.model_was_persisted());
    assert!(!config.output_dir.join("trained_model.bin").exists());
    assert!(!config.output_dir.join("trained_model.labels.bin").exists());
}

#[test]
fn skip_policy_drops_missing_images() {
    let dir = TempDir::new().unwrap();
    let image = ImageConfig {
        missing_images: classify_pipeline::MissingImagePolicy::Skip,
        ..small_image_config()
    };
    let config = image_config(dir.path(), image);
    fs::remove_file(config.dataset.join("train").join("red_0.png")).unwrap();

    let outcome = Pipeline::new(config).run(Mode::TrainAndEvaluate).unwrap();
    assert_eq!(outcome.evaluation_samples, 7);
}

#[test]
fn pretrained_backbone_must_match_image_size() {
    let dir = TempDir::new().unwrap();
    let mut image = small_image_config();

    let weights_store = ArtifactStore::new(dir.path().join("weights"));
    let matching = Backbone::initialise(&image.backbone, image.target_size, 7);
    let good = weights_store.save("backbone_8x8", ArtifactKind::Backbone, &matching).unwrap();
    let other = Backbone::initialise(&image.backbone, (16, 16), 7);
    let bad = weights_store.save("backbone_16x16", ArtifactKind::Backbone, &other).unwrap();

    image.backbone.weights = Some(good);
    let config = image_config(dir.path(), image.clone());
    Pipeline::new(config).run(Mode::TrainAndEvaluate).unwrap();

    image.backbone.weights = Some(bad);
    let config = PipelineConfig {
        variant: VariantConfig::Image(image),
        output_dir: dir.path().join("output_bad"),
        dataset: dir.path().join("datasets"),
        ..PipelineConfig::image_defaults()
    };
    let err = Pipeline::new(config).run(Mode::TrainAndEvaluate).unwrap_err();
    assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
}
