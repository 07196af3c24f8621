// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! SVG charts for an evaluation run
//!
//! Every renderer is a pure function of report data plus an output path and
//! replaces whatever file was there before.

use crate::classifiers::EpochStats;
use crate::error::{PipelineError, Result};
use crate::metrics::EvaluationReport;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 560.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 200.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 80.0;
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_TEXT: &str = "#2c3e50";
const FONT: &str = "Arial, sans-serif";
const PALETTE: [&str; 8] = [
    "#3498db", "#e74c3c", "#2ecc71", "#9b59b6", "#f39c12", "#1abc9c", "#34495e", "#d35400",
];

pub const CONFUSION_MATRIX_FILE: &str = "confusion_matrix.svg";
pub const ROC_CURVE_FILE: &str = "roc_curve.svg";
pub const PR_CURVE_FILE: &str = "precision_recall_curve.svg";
pub const RATING_SCATTER_FILE: &str = "rating_scatter_plot.svg";
pub const TRAINING_HISTORY_FILE: &str = "training_history.svg";

/// One rendered chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationArtifact {
    pub section: String,
    pub path: PathBuf,
}

fn color(i: usize) -> &'static str {
    PALETTE[i % PALETTE.len()]
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn write_svg(section: &str, path: &Path, svg: String) -> Result<VisualizationArtifact> {
    fs::write(path, svg).map_err(|e| PipelineError::RenderFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    tracing::debug!("Wrote {} to {}", section, path.display());
    Ok(VisualizationArtifact {
        section: section.to_string(),
        path: path.to_path_buf(),
    })
}

/// Plot area with linear axes; data coordinates are mapped into it
struct Plot {
    svg: String,
    x_range: (f64, f64),
    y_range: (f64, f64),
}

impl Plot {
    fn new(title: &str, x_range: (f64, f64), y_range: (f64, f64)) -> Self {
        let mut svg = String::new();
        svg.push_str(&format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
            CHART_WIDTH, CHART_HEIGHT, CHART_WIDTH, CHART_HEIGHT
        ));
        svg.push_str(&format!(
            r#"<rect width="{}" height="{}" fill="white"/>"#,
            CHART_WIDTH, CHART_HEIGHT
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="35" text-anchor="middle" font-family="{}" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
            MARGIN_LEFT + plot_width() / 2.0,
            FONT,
            COLOR_TEXT,
            escape(title)
        ));
        Self { svg, x_range, y_range }
    }

    fn x(&self, value: f64) -> f64 {
        let (lo, hi) = self.x_range;
        MARGIN_LEFT + (value - lo) / span(lo, hi) * plot_width()
    }

    fn y(&self, value: f64) -> f64 {
        let (lo, hi) = self.y_range;
        MARGIN_TOP + plot_height() - (value - lo) / span(lo, hi) * plot_height()
    }

    /// Five grid lines per axis plus tick labels and axis titles
    fn axes(&mut self, x_label: &str, y_label: &str) {
        for i in 0..=5 {
            let t = i as f64 / 5.0;
            let yv = self.y_range.0 + t * (self.y_range.1 - self.y_range.0);
            let xv = self.x_range.0 + t * (self.x_range.1 - self.x_range.0);
            let (px, py) = (self.x(xv), self.y(yv));

            self.svg.push_str(&format!(
                r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
                MARGIN_LEFT,
                py,
                MARGIN_LEFT + plot_width(),
                py,
                COLOR_GRID
            ));
            self.svg.push_str(&format!(
                r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
                px,
                MARGIN_TOP,
                px,
                MARGIN_TOP + plot_height(),
                COLOR_GRID
            ));
            self.svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="end" font-family="{}" font-size="12" fill="{}">{}</text>"#,
                MARGIN_LEFT - 10.0,
                py + 4.0,
                FONT,
                COLOR_TEXT,
                tick(yv)
            ));
            self.svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="middle" font-family="{}" font-size="12" fill="{}">{}</text>"#,
                px,
                MARGIN_TOP + plot_height() + 20.0,
                FONT,
                COLOR_TEXT,
                tick(xv)
            ));
        }

        self.svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="{}" height="{}" fill="none" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            MARGIN_TOP,
            plot_width(),
            plot_height(),
            COLOR_TEXT
        ));
        self.svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="{}" font-size="14" fill="{}">{}</text>"#,
            MARGIN_LEFT + plot_width() / 2.0,
            CHART_HEIGHT - 20.0,
            FONT,
            COLOR_TEXT,
            escape(x_label)
        ));
        self.svg.push_str(&format!(
            r#"<text x="20" y="{}" text-anchor="middle" font-family="{}" font-size="14" fill="{}" transform="rotate(-90 20 {})">{}</text>"#,
            MARGIN_TOP + plot_height() / 2.0,
            FONT,
            COLOR_TEXT,
            MARGIN_TOP + plot_height() / 2.0,
            escape(y_label)
        ));
    }

    fn polyline(&mut self, xs: &[f64], ys: &[f64], stroke: &str, dashed: bool) {
        let points: Vec<String> = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| format!("{:.2},{:.2}", self.x(*x), self.y(*y)))
            .collect();
        let dash = if dashed { r#" stroke-dasharray="6,4""# } else { "" };
        self.svg.push_str(&format!(
            r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"{}/>"#,
            points.join(" "),
            stroke,
            dash
        ));
    }

    fn dot(&mut self, x: f64, y: f64, fill: &str) {
        self.svg.push_str(&format!(
            r#"<circle cx="{:.2}" cy="{:.2}" r="3" fill="{}" fill-opacity="0.6"/>"#,
            self.x(x),
            self.y(y),
            fill
        ));
    }

    /// Legend column to the right of the plot area
    fn legend(&mut self, entries: &[(String, &str)]) {
        let x = MARGIN_LEFT + plot_width() + 20.0;
        for (i, (text, fill)) in entries.iter().enumerate() {
            let y = MARGIN_TOP + 10.0 + i as f64 * 22.0;
            self.svg.push_str(&format!(
                r#"<rect x="{}" y="{}" width="15" height="15" fill="{}" rx="2"/>"#,
                x,
                y - 12.0,
                fill
            ));
            self.svg.push_str(&format!(
                r#"<text x="{}" y="{}" font-family="{}" font-size="12" fill="{}">{}</text>"#,
                x + 20.0,
                y,
                FONT,
                COLOR_TEXT,
                escape(text)
            ));
        }
    }

    fn finish(mut self) -> String {
        self.svg.push_str("</svg>");
        self.svg
    }
}

fn plot_width() -> f64 {
    CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT
}

fn plot_height() -> f64 {
    CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM
}

fn span(lo: f64, hi: f64) -> f64 {
    if (hi - lo).abs() < f64::EPSILON {
        1.0
    } else {
        hi - lo
    }
}

fn tick(value: f64) -> String {
    if value.abs() >= 100.0 || value.fract().abs() < 1e-9 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

/// Min and max of `values`, padded by 5% of the span
fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = span(lo, hi) * 0.05;
    (lo - pad, hi + pad)
}

/// Heatmap of counts, true classes on rows, predicted on columns
pub fn render_confusion_matrix(report: &EvaluationReport, path: &Path) -> Result<VisualizationArtifact> {
    let k = report.labels.len().max(1);
    let cell = (plot_width().min(plot_height())) / k as f64;
    let max = report
        .confusion_matrix
        .counts
        .iter()
        .flatten()
        .copied()
        .max()
        .unwrap_or(0)
        .max(1) as f64;

    let mut plot = Plot::new("Confusion Matrix", (0.0, 1.0), (0.0, 1.0));
    for (t, row) in report.confusion_matrix.counts.iter().enumerate() {
        for (p, count) in row.iter().enumerate() {
            let intensity = *count as f64 / max;
            let x = MARGIN_LEFT + p as f64 * cell;
            let y = MARGIN_TOP + t as f64 * cell;
            plot.svg.push_str(&format!(
                r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{}" stroke="white"/>"#,
                x,
                y,
                cell,
                cell,
                blue_scale(intensity)
            ));
            let text_color = if intensity > 0.5 { "white" } else { COLOR_TEXT };
            plot.svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="middle" font-family="{}" font-size="14" fill="{}">{}</text>"#,
                x + cell / 2.0,
                y + cell / 2.0 + 5.0,
                FONT,
                text_color,
                count
            ));
        }
    }

    for (i, label) in report.labels.iter().enumerate() {
        let center = i as f64 * cell + cell / 2.0;
        plot.svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="{}" font-size="12" fill="{}">{}</text>"#,
            MARGIN_LEFT + center,
            MARGIN_TOP + k as f64 * cell + 20.0,
            FONT,
            COLOR_TEXT,
            escape(label)
        ));
        plot.svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="{}" font-size="12" fill="{}">{}</text>"#,
            MARGIN_LEFT - 10.0,
            MARGIN_TOP + center + 4.0,
            FONT,
            COLOR_TEXT,
            escape(label)
        ));
    }
    plot.svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="{}" font-size="14" fill="{}">Predicted</text>"#,
        MARGIN_LEFT + k as f64 * cell / 2.0,
        MARGIN_TOP + k as f64 * cell + 45.0,
        FONT,
        COLOR_TEXT
    ));
    plot.svg.push_str(&format!(
        r#"<text x="20" y="{}" text-anchor="middle" font-family="{}" font-size="14" fill="{}" transform="rotate(-90 20 {})">True</text>"#,
        MARGIN_TOP + k as f64 * cell / 2.0,
        FONT,
        COLOR_TEXT,
        MARGIN_TOP + k as f64 * cell / 2.0
    ));

    write_svg("confusion_matrix", path, plot.finish())
}

/// White to dark blue
fn blue_scale(intensity: f64) -> String {
    let t = intensity.clamp(0.0, 1.0);
    let lerp = |a: f64, b: f64| (a + (b - a) * t).round() as u8;
    format!("#{:02x}{:02x}{:02x}", lerp(247.0, 8.0), lerp(251.0, 48.0), lerp(255.0, 107.0))
}

/// One-vs-rest ROC per class with the chance diagonal
pub fn render_roc_curves(report: &EvaluationReport, path: &Path) -> Result<VisualizationArtifact> {
    let mut plot = Plot::new("Receiver Operating Characteristic", (0.0, 1.0), (0.0, 1.0));
    plot.axes("False Positive Rate", "True Positive Rate");
    plot.polyline(&[0.0, 1.0], &[0.0, 1.0], "#95a5a6", true);

    let mut legend = Vec::new();
    for (i, roc) in report.roc.iter().enumerate() {
        let Some(auc) = roc.auc else {
            legend.push((format!("{} (AUC n/a)", roc.label), "#bdc3c7"));
            continue;
        };
        plot.polyline(&roc.fpr, &roc.tpr, color(i), false);
        legend.push((format!("{} (AUC = {:.2})", roc.label, auc), color(i)));
    }
    plot.legend(&legend);

    write_svg("roc_curve", path, plot.finish())
}

/// Precision against recall per class
pub fn render_pr_curves(report: &EvaluationReport, path: &Path) -> Result<VisualizationArtifact> {
    let mut plot = Plot::new("Precision-Recall Curve", (0.0, 1.0), (0.0, 1.0));
    plot.axes("Recall", "Precision");

    let mut legend = Vec::new();
    for (i, pr) in report.pr.iter().enumerate() {
        let Some(ap) = pr.average_precision else {
            legend.push((format!("{} (AP n/a)", pr.label), "#bdc3c7"));
            continue;
        };
        plot.polyline(&pr.recall, &pr.precision, color(i), false);
        legend.push((format!("{} (AP = {:.2})", pr.label, ap), color(i)));
    }
    plot.legend(&legend);

    write_svg("precision_recall_curve", path, plot.finish())
}

/// Scatter of two raw feature columns, colored by predicted class
pub fn render_rating_scatter(
    pairs: &[(f64, f64)],
    predictions: &[usize],
    labels: &[String],
    axis_names: (&str, &str),
    path: &Path,
) -> Result<VisualizationArtifact> {
    if pairs.len() != predictions.len() {
        return Err(PipelineError::ShapeMismatch {
            expected: format!("{} predictions", pairs.len()),
            actual: format!("{} predictions", predictions.len()),
        });
    }

    let x_range = padded_range(pairs.iter().map(|p| p.0));
    let y_range = padded_range(pairs.iter().map(|p| p.1));
    let mut plot = Plot::new(
        &format!("{} vs {} (colored by prediction)", axis_names.0, axis_names.1),
        x_range,
        y_range,
    );
    plot.axes(axis_names.0, axis_names.1);

    for ((x, y), class) in pairs.iter().zip(predictions) {
        plot.dot(*x, *y, color(*class));
    }
    let legend: Vec<(String, &str)> = labels
        .iter()
        .enumerate()
        .map(|(i, l)| (format!("predicted {}", l), color(i)))
        .collect();
    plot.legend(&legend);

    write_svg("rating_scatter_plot", path, plot.finish())
}

/// Accuracy and loss per epoch
pub fn render_training_history(history: &[EpochStats], path: &Path) -> Result<VisualizationArtifact> {
    let epochs: Vec<f64> = history.iter().map(|h| h.epoch as f64).collect();
    let accuracy: Vec<f64> = history.iter().map(|h| h.accuracy).collect();
    let loss: Vec<f64> = history.iter().map(|h| h.loss).collect();

    let x_range = if epochs.len() > 1 {
        (epochs[0], epochs[epochs.len() - 1])
    } else {
        (0.0, 1.0_f64.max(epochs.first().copied().unwrap_or(1.0)))
    };
    let y_max = loss
        .iter()
        .chain(&accuracy)
        .copied()
        .filter(|v| v.is_finite())
        .fold(1.0_f64, f64::max);

    let mut plot = Plot::new("Training History", x_range, (0.0, y_max));
    plot.axes("Epoch", "Value");
    plot.polyline(&epochs, &accuracy, color(0), false);
    plot.polyline(&epochs, &loss, color(1), false);
    for ((e, a), l) in epochs.iter().zip(&accuracy).zip(&loss) {
        plot.dot(*e, *a, color(0));
        plot.dot(*e, *l, color(1));
    }
    plot.legend(&[("accuracy".to_string(), color(0)), ("loss".to_string(), color(1))]);

    write_svg("training_history", path, plot.finish())
}
