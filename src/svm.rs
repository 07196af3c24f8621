// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Linear-kernel support vector classifier
//!
//! Trained with Sequential Minimal Optimization. Because the kernel is
//! linear the primal weight vector is maintained alongside the dual
//! coefficients, so decision values cost one dot product and no kernel
//! matrix is ever materialised. Two classes train a single machine; more
//! classes train one machine per class (one-vs-rest).

use crate::classifiers::{accuracy, Classifier, EpochStats, TrainingSummary};
use crate::config::SvmConfig;
use crate::error::{PipelineError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Dual coefficients below this count as zero
const ALPHA_EPS: f64 = 1e-8;

/// One binary separating hyperplane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Hyperplane {
    weights: Array1<f64>,
    bias: f64,
    n_support: usize,
}

impl Hyperplane {
    fn decision(&self, x: ArrayView1<f64>) -> f64 {
        self.weights.dot(&x) + self.bias
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSvm {
    config: SvmConfig,
    seed: u64,
    n_classes: usize,
    n_features: usize,
    planes: Vec<Hyperplane>,
}

impl LinearSvm {
    pub fn new(config: SvmConfig, seed: u64, n_classes: usize) -> Self {
        Self {
            config,
            seed,
            n_classes,
            n_features: 0,
            planes: Vec::new(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.planes.is_empty()
    }

    /// Signed distances from each hyperplane, shape (n, planes)
    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if !self.is_fitted() {
            return Err(PipelineError::TrainingFailed("model has not been fitted".to_string()));
        }
        if x.ncols() != self.n_features {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} features", self.n_features),
                actual: format!("{} features", x.ncols()),
            });
        }
        let mut out = Array2::zeros((x.nrows(), self.planes.len()));
        for (i, row) in x.rows().into_iter().enumerate() {
            for (k, plane) in self.planes.iter().enumerate() {
                out[[i, k]] = plane.decision(row);
            }
        }
        Ok(out)
    }

    /// Simplified Platt SMO for targets in {-1, +1}
    fn smo(&self, x: &Array2<f64>, y: &Array1<f64>, rng: &mut ChaCha8Rng) -> Hyperplane {
        let n = x.nrows();
        let c = self.config.c;
        let tol = self.config.tol;

        let mut alphas = Array1::<f64>::zeros(n);
        let mut weights = Array1::<f64>::zeros(x.ncols());
        let mut bias = 0.0;
        let sq_norms: Vec<f64> = x.rows().into_iter().map(|r| r.dot(&r)).collect();

        let mut passes = 0;
        let mut iterations = 0;

        while passes < self.config.max_passes && iterations < self.config.max_iter {
            let mut changed = 0;

            for i in 0..n {
                let xi = x.row(i);
                let e_i = weights.dot(&xi) + bias - y[i];

                // KKT violation check
                if !((y[i] * e_i < -tol && alphas[i] < c) || (y[i] * e_i > tol && alphas[i] > 0.0)) {
                    continue;
                }

                let j = loop {
                    let j = rng.gen_range(0..n);
                    if j != i {
                        break j;
                    }
                };
                let xj = x.row(j);
                let e_j = weights.dot(&xj) + bias - y[j];

                let (alpha_i_old, alpha_j_old) = (alphas[i], alphas[j]);
                let (low, high) = if y[i] != y[j] {
                    ((alpha_j_old - alpha_i_old).max(0.0), (c + alpha_j_old - alpha_i_old).min(c))
                } else {
                    ((alpha_i_old + alpha_j_old - c).max(0.0), (alpha_i_old + alpha_j_old).min(c))
                };
                if (high - low).abs() < 1e-12 {
                    continue;
                }

                let k_ij = xi.dot(&xj);
                let eta = 2.0 * k_ij - sq_norms[i] - sq_norms[j];
                if eta >= 0.0 {
                    continue;
                }

                let alpha_j = (alpha_j_old - y[j] * (e_i - e_j) / eta).clamp(low, high);
                if (alpha_j - alpha_j_old).abs() < 1e-5 {
                    continue;
                }
                let alpha_i = alpha_i_old + y[i] * y[j] * (alpha_j_old - alpha_j);

                let d_i = y[i] * (alpha_i - alpha_i_old);
                let d_j = y[j] * (alpha_j - alpha_j_old);

                let b1 = bias - e_i - d_i * sq_norms[i] - d_j * k_ij;
                let b2 = bias - e_j - d_i * k_ij - d_j * sq_norms[j];
                bias = if alpha_i > 0.0 && alpha_i < c {
                    b1
                } else if alpha_j > 0.0 && alpha_j < c {
                    b2
                } else {
                    (b1 + b2) / 2.0
                };

                weights.scaled_add(d_i, &xi);
                weights.scaled_add(d_j, &xj);
                alphas[i] = alpha_i;
                alphas[j] = alpha_j;
                changed += 1;
            }

            iterations += 1;
            passes = if changed == 0 { passes + 1 } else { 0 };
        }

        if passes < self.config.max_passes {
            tracing::warn!(
                "SMO stopped at max_iter={} before {} quiet passes",
                self.config.max_iter,
                self.config.max_passes
            );
        }

        let n_support = alphas.iter().filter(|a| **a > ALPHA_EPS).count();
        tracing::debug!("SMO finished after {} iterations with {} support vectors", iterations, n_support);

        Hyperplane {
            weights,
            bias,
            n_support,
        }
    }

    fn hinge_loss(&self, x: &Array2<f64>, y: &[usize]) -> Result<f64> {
        let decisions = self.decision_function(x)?;
        let mut total = 0.0;
        for (row, &label) in decisions.rows().into_iter().zip(y) {
            for (k, d) in row.iter().enumerate() {
                let target = if self.planes.len() == 1 {
                    if label == 1 { 1.0 } else { -1.0 }
                } else if label == k {
                    1.0
                } else {
                    -1.0
                };
                total += (1.0 - target * d).max(0.0);
            }
        }
        Ok(total / (y.len() * self.planes.len()).max(1) as f64)
    }
}

impl Classifier for LinearSvm {
    type Input = Array2<f64>;

    fn fit(&mut self, x: &Array2<f64>, y: &[usize]) -> Result<TrainingSummary> {
        if x.nrows() != y.len() {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} labels", x.nrows()),
                actual: format!("{} labels", y.len()),
            });
        }
        if x.nrows() < 2 {
            return Err(PipelineError::TrainingFailed(format!(
                "need at least 2 training samples, got {}",
                x.nrows()
            )));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::TrainingFailed("training features contain NaN or infinity".to_string()));
        }
        if let Some(bad) = y.iter().find(|&&l| l >= self.n_classes) {
            return Err(PipelineError::TrainingFailed(format!(
                "label {} outside the {} configured classes",
                bad, self.n_classes
            )));
        }
        let mut present: Vec<usize> = y.to_vec();
        present.sort_unstable();
        present.dedup();
        if present.len() < 2 {
            return Err(PipelineError::TrainingFailed(
                "training subset contains a single class; an SVM needs at least two".to_string(),
            ));
        }

        self.n_features = x.ncols();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);

        self.planes = if self.n_classes == 2 {
            let targets: Array1<f64> = y.iter().map(|&l| if l == 1 { 1.0 } else { -1.0 }).collect();
            vec![self.smo(x, &targets, &mut rng)]
        } else {
            (0..self.n_classes)
                .map(|k| {
                    if !present.contains(&k) {
                        tracing::warn!("Class {} has no training samples; its scores stay negative", k);
                        return Hyperplane {
                            weights: Array1::zeros(self.n_features),
                            bias: -1.0,
                            n_support: 0,
                        };
                    }
                    let targets: Array1<f64> = y.iter().map(|&l| if l == k { 1.0 } else { -1.0 }).collect();
                    self.smo(x, &targets, &mut rng)
                })
                .collect()
        };

        if self
            .planes
            .iter()
            .any(|p| !p.bias.is_finite() || p.weights.iter().any(|w| !w.is_finite()))
        {
            self.planes.clear();
            return Err(PipelineError::TrainingFailed("SMO produced non-finite parameters".to_string()));
        }

        let predictions = self.predict(x)?;
        let train_accuracy = accuracy(y, &predictions);
        let loss = self.hinge_loss(x, y)?;

        tracing::info!(
            "Linear SVM fitted on {} samples: train accuracy {:.4}, hinge loss {:.4}",
            y.len(),
            train_accuracy,
            loss
        );

        Ok(TrainingSummary::from_history(
            vec![EpochStats {
                epoch: 1,
                accuracy: train_accuracy,
                loss,
            }],
            y.len(),
        ))
    }

    fn predict_scores(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let decisions = self.decision_function(x)?;
        if self.planes.len() == 1 {
            let mut scores = Array2::zeros((x.nrows(), 2));
            for (i, d) in decisions.column(0).iter().enumerate() {
                scores[[i, 0]] = -d;
                scores[[i, 1]] = *d;
            }
            Ok(scores)
        } else {
            Ok(decisions)
        }
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn name(&self) -> &str {
        "LinearSVM"
    }

    fn description(&self) -> &str {
        "Soft-margin linear support vector classifier trained with SMO"
    }
}
