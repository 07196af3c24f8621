// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation metrics for binary and multi-class classification
//!
//! Implements:
//! - K x K confusion matrix (rows = true class, columns = predicted)
//! - Accuracy, per-class precision / recall / F1 / support
//! - Macro and support-weighted averages
//! - One-vs-rest ROC curves with AUC and precision-recall curves with AP

use crate::encoding::LabelSpace;
use crate::error::{PipelineError, Result};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Confusion matrix over `n_classes` classes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// counts[true][predicted]
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Create from ground truth and predictions (class indices)
    pub fn from_predictions(n_classes: usize, y_true: &[usize], y_pred: &[usize]) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} predictions", y_true.len()),
                actual: format!("{} predictions", y_pred.len()),
            });
        }

        let mut counts = vec![vec![0; n_classes]; n_classes];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            if t >= n_classes || p >= n_classes {
                return Err(PipelineError::ShapeMismatch {
                    expected: format!("class indices below {}", n_classes),
                    actual: format!("true {} / predicted {}", t, p),
                });
            }
            counts[t][p] += 1;
        }
        Ok(Self { counts })
    }

    pub fn n_classes(&self) -> usize {
        self.counts.len()
    }

    /// Total number of samples
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Samples whose true class is `class` (row sum)
    pub fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// Samples predicted as `class` (column sum)
    pub fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.n_classes()).map(|k| self.counts[k][k]).sum()
    }

    /// Accuracy: trace / total, 0.0 when empty
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.correct() as f64 / total as f64
    }

    /// Precision: TP / (TP + FP)
    pub fn precision(&self, class: usize) -> f64 {
        ratio(self.counts[class][class], self.predicted(class))
    }

    /// Recall: TP / (TP + FN)
    pub fn recall(&self, class: usize) -> f64 {
        ratio(self.counts[class][class], self.support(class))
    }

    /// F1 Score: 2 * (Precision * Recall) / (Precision + Recall)
    pub fn f1_score(&self, class: usize) -> f64 {
        let precision = self.precision(class);
        let recall = self.recall(class);
        let denom = precision + recall;
        if denom == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / denom
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        return 0.0;
    }
    num as f64 / denom as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// One-vs-rest ROC curve for a single class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub label: String,
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// None when the class has no positives or no negatives
    pub auc: Option<f64>,
}

impl RocCurve {
    /// One point per distinct threshold, starting at (0, 0)
    pub fn compute(label: &str, is_positive: &[bool], scores: ArrayView1<f64>) -> Self {
        let n_pos = is_positive.iter().filter(|p| **p).count();
        let n_neg = is_positive.len() - n_pos;
        if n_pos == 0 || n_neg == 0 {
            return Self {
                label: label.to_string(),
                fpr: Vec::new(),
                tpr: Vec::new(),
                auc: None,
            };
        }

        let mut fpr = vec![0.0];
        let mut tpr = vec![0.0];
        let (mut tp, mut fp) = (0usize, 0usize);
        let ranked = rank_descending(is_positive, scores);
        for (i, (score, positive)) in ranked.iter().enumerate() {
            if *positive {
                tp += 1;
            } else {
                fp += 1;
            }
            // Ties share one threshold
            let last_of_threshold = ranked.get(i + 1).map_or(true, |(next, _)| next != score);
            if last_of_threshold {
                fpr.push(fp as f64 / n_neg as f64);
                tpr.push(tp as f64 / n_pos as f64);
            }
        }

        // Trapezoidal rule
        let auc = fpr
            .windows(2)
            .zip(tpr.windows(2))
            .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
            .sum::<f64>();

        Self {
            label: label.to_string(),
            fpr,
            tpr,
            auc: Some(auc),
        }
    }
}

/// Precision-recall curve for a single class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCurve {
    pub label: String,
    pub recall: Vec<f64>,
    pub precision: Vec<f64>,
    /// Σ (R_n - R_{n-1}) P_n; None when the class has no positives
    pub average_precision: Option<f64>,
}

impl PrCurve {
    pub fn compute(label: &str, is_positive: &[bool], scores: ArrayView1<f64>) -> Self {
        let n_pos = is_positive.iter().filter(|p| **p).count();
        if n_pos == 0 {
            return Self {
                label: label.to_string(),
                recall: Vec::new(),
                precision: Vec::new(),
                average_precision: None,
            };
        }

        let mut recall = Vec::new();
        let mut precision = Vec::new();
        let (mut tp, mut seen) = (0usize, 0usize);
        let mut ap = 0.0;
        let mut prev_recall = 0.0;
        let ranked = rank_descending(is_positive, scores);
        for (i, (score, positive)) in ranked.iter().enumerate() {
            seen += 1;
            if *positive {
                tp += 1;
            }
            let last_of_threshold = ranked.get(i + 1).map_or(true, |(next, _)| next != score);
            if last_of_threshold {
                let r = tp as f64 / n_pos as f64;
                let p = tp as f64 / seen as f64;
                ap += (r - prev_recall) * p;
                prev_recall = r;
                recall.push(r);
                precision.push(p);
            }
        }

        Self {
            label: label.to_string(),
            recall,
            precision,
            average_precision: Some(ap),
        }
    }
}

/// Weighted mean of the per-class metrics; all zero when the weights sum to 0
fn average(per_class: &[ClassMetrics], weights: &[f64], support: usize) -> AverageMetrics {
    let norm: f64 = weights.iter().sum();
    let mean = |f: fn(&ClassMetrics) -> f64| {
        if norm == 0.0 {
            return 0.0;
        }
        per_class.iter().zip(weights).map(|(m, w)| w * f(m)).sum::<f64>() / norm
    };
    AverageMetrics {
        precision: mean(|m| m.precision),
        recall: mean(|m| m.recall),
        f1_score: mean(|m| m.f1_score),
        support,
    }
}

/// (score, positive) pairs sorted by score descending
fn rank_descending(is_positive: &[bool], scores: ArrayView1<f64>) -> Vec<(f64, bool)> {
    let mut pairs: Vec<(f64, bool)> = scores.iter().copied().zip(is_positive.iter().copied()).collect();
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    pairs
}

/// Complete evaluation of one classifier on one evaluation subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub labels: Vec<String>,
    pub confusion_matrix: ConfusionMatrix,
    pub accuracy: f64,
    pub per_class: Vec<ClassMetrics>,
    pub macro_avg: AverageMetrics,
    pub weighted_avg: AverageMetrics,
    pub roc: Vec<RocCurve>,
    pub pr: Vec<PrCurve>,
    pub n_samples: usize,
}

impl EvaluationReport {
    /// `scores` is (n, K), column k being the score of class k
    pub fn compute(
        label_space: &LabelSpace,
        y_true: &[usize],
        y_pred: &[usize],
        scores: &Array2<f64>,
    ) -> Result<Self> {
        let k = label_space.len();
        if scores.dim() != (y_true.len(), k) {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("scores of shape ({}, {})", y_true.len(), k),
                actual: format!("{:?}", scores.dim()),
            });
        }

        let cm = ConfusionMatrix::from_predictions(k, y_true, y_pred)?;
        let labels = label_space.names().to_vec();

        let per_class: Vec<ClassMetrics> = (0..k)
            .map(|c| ClassMetrics {
                label: labels[c].clone(),
                precision: cm.precision(c),
                recall: cm.recall(c),
                f1_score: cm.f1_score(c),
                support: cm.support(c),
            })
            .collect();

        let n = cm.total();
        let macro_avg = average(&per_class, &vec![1.0; k], n);
        let weights: Vec<f64> = per_class.iter().map(|m| m.support as f64).collect();
        let weighted_avg = average(&per_class, &weights, n);

        let mut roc = Vec::with_capacity(k);
        let mut pr = Vec::with_capacity(k);
        for c in 0..k {
            let is_positive: Vec<bool> = y_true.iter().map(|&t| t == c).collect();
            roc.push(RocCurve::compute(&labels[c], &is_positive, scores.column(c)));
            pr.push(PrCurve::compute(&labels[c], &is_positive, scores.column(c)));
        }

        Ok(Self {
            accuracy: cm.accuracy(),
            labels,
            confusion_matrix: cm,
            per_class,
            macro_avg,
            weighted_avg,
            roc,
            pr,
            n_samples: n,
        })
    }

    /// Positive-class (index 1) metrics of a binary problem
    pub fn binary_summary(&self) -> Option<&ClassMetrics> {
        if self.labels.len() == 2 {
            self.per_class.get(1)
        } else {
            None
        }
    }

    /// Text table in the scikit-learn `classification_report` layout
    pub fn classification_report(&self) -> String {
        const HEADERS: [&str; 4] = ["precision", "recall", "f1-score", "support"];
        let width = self
            .labels
            .iter()
            .map(|l| l.chars().count())
            .max()
            .unwrap_or(0)
            .max("weighted avg".len());

        let mut out = format!("{:>width$} ", "", width = width);
        for header in HEADERS {
            out.push_str(&format!(" {:>9}", header));
        }
        out.push_str("\n\n");

        let row = |name: &str, p: f64, r: f64, f: f64, support: usize| {
            format!(
                "{:>width$}  {:>9.2} {:>9.2} {:>9.2} {:>9}\n",
                name,
                p,
                r,
                f,
                support,
                width = width
            )
        };

        for m in &self.per_class {
            out.push_str(&row(&m.label, m.precision, m.recall, m.f1_score, m.support));
        }
        out.push('\n');
        out.push_str(&format!(
            "{:>width$}  {:>9} {:>9} {:>9.2} {:>9}\n",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.n_samples,
            width = width
        ));
        for (name, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            out.push_str(&row(name, avg.precision, avg.recall, avg.f1_score, avg.support));
        }
        out
    }
}
