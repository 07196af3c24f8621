// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classification pipeline CLI
//!
//! Usage:
//!   classify-pipeline train --dataset games.csv --seed 42
//!   classify-pipeline --variant image train --dataset ./datasets --output ./output
//!   classify-pipeline --config run.json evaluate

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use classify_pipeline::config::{ImageConfig, PipelineConfig, TabularConfig, VariantConfig};
use classify_pipeline::pipeline::{Mode, Pipeline};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "classify-pipeline")]
#[command(about = "Train, persist and evaluate tabular or image classifiers")]
#[command(version)]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pipeline variant
    #[arg(long, value_enum, global = true)]
    variant: Option<Variant>,

    /// Data file (tabular) or dataset directory (image)
    #[arg(short, long, global = true)]
    dataset: Option<PathBuf>,

    /// Output directory for artifacts, metrics and plots
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Name the model is persisted under
    #[arg(short, long, global = true)]
    model_name: Option<String>,

    /// Random seed for reproducibility
    #[arg(short, long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit a model, persist it and evaluate it
    Train,
    /// Evaluate a previously persisted model
    Evaluate,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Variant {
    Tabular,
    Image,
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match (&args.config, args.variant) {
        (Some(path), _) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        (None, Some(Variant::Image)) => PipelineConfig::image_defaults(),
        (None, _) => PipelineConfig::default(),
    };

    match (args.variant, &config.variant) {
        (Some(Variant::Image), VariantConfig::Tabular(_)) => {
            config.variant = VariantConfig::Image(ImageConfig::default());
        }
        (Some(Variant::Tabular), VariantConfig::Image(_)) => {
            config.variant = VariantConfig::Tabular(TabularConfig::default());
        }
        _ => {}
    }

    if let Some(dataset) = &args.dataset {
        config.dataset = dataset.clone();
    }
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(name) = &args.model_name {
        config.model_name = name.clone();
    }
    if let Some(seed) = args.seed {
        match &mut config.variant {
            VariantConfig::Tabular(tabular) => tabular.seed = seed,
            VariantConfig::Image(image) => image.seed = seed,
        }
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let mode = match args.command {
        Command::Train => Mode::TrainAndEvaluate,
        Command::Evaluate => Mode::EvaluateOnly,
    };

    tracing::info!("Classification Pipeline");
    tracing::info!("=======================");
    tracing::info!("Variant: {}", config.variant.name());
    tracing::info!("Dataset: {}", config.dataset.display());
    tracing::info!("Output: {}", config.output_dir.display());

    let pipeline = Pipeline::new(config);
    let outcome = match pipeline.run(mode) {
        Ok(outcome) => outcome,
        Err(err) if err.model_was_persisted() => {
            return Err(err).context(format!(
                "Model artifacts were written to {}, but evaluation did not complete",
                pipeline.config().output_dir.display()
            ));
        }
        Err(err) => return Err(err).context("Pipeline run failed"),
    };

    // Print summary to console
    println!("\n{}", "=".repeat(70));
    println!("EVALUATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!(
        "\nAccuracy: {:.4} on {} samples{}",
        outcome.report.accuracy,
        outcome.evaluation_samples,
        if outcome.evaluated_on_training_data {
            " (training data)"
        } else {
            ""
        }
    );
    if mode == Mode::TrainAndEvaluate {
        println!(
            "Training: accuracy {:.4}, loss {:.4} over {} samples",
            outcome.training.final_accuracy, outcome.training.final_loss, outcome.training.training_samples
        );
    }
    println!("\n{}", outcome.report.classification_report());

    for path in &outcome.artifacts {
        println!("Artifact: {}", path.display());
    }
    for chart in &outcome.visualizations {
        println!("Chart ({}): {}", chart.section, chart.path.display());
    }
    println!("Metrics saved to: {}", outcome.metrics_path.display());
    println!("JSON results saved to: {}", outcome.results_path.display());

    println!("\nRun complete!");

    Ok(())
}
