// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Trainable classifier capability shared by every pipeline variant
//!
//! Implementations:
//! - `LinearSvm` (tabular features, see `svm`)
//! - `TransferClassifier` (image tensors, see `transfer`)

use crate::error::{PipelineError, Result};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Accuracy and loss recorded for one training pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub accuracy: f64,
    pub loss: f64,
}

/// What `fit` reports, independent of the evaluation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub final_accuracy: f64,
    pub final_loss: f64,
    pub history: Vec<EpochStats>,
    pub training_samples: usize,
}

impl TrainingSummary {
    pub fn from_history(history: Vec<EpochStats>, training_samples: usize) -> Self {
        let last = history.last().copied().unwrap_or(EpochStats {
            epoch: 0,
            accuracy: 0.0,
            loss: 0.0,
        });
        Self {
            final_accuracy: last.accuracy,
            final_loss: last.loss,
            history,
            training_samples,
        }
    }
}

/// Fit / predict / serialize contract the orchestrator drives
pub trait Classifier: Serialize + DeserializeOwned {
    /// Feature container the model consumes
    type Input;

    /// Fit on encoded training data; labels are class indices
    fn fit(&mut self, x: &Self::Input, y: &[usize]) -> Result<TrainingSummary>;

    /// Per-class scores, shape (n, n_classes); larger means more likely
    fn predict_scores(&self, x: &Self::Input) -> Result<Array2<f64>>;

    fn n_classes(&self) -> usize;

    /// Arg-max of `predict_scores`
    fn predict(&self, x: &Self::Input) -> Result<Vec<usize>> {
        Ok(argmax_rows(&self.predict_scores(x)?))
    }

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| PipelineError::ArtifactCorrupt {
            name: self.name().to_string(),
            reason: format!("failed to serialize: {}", e),
        })
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PipelineError::ArtifactCorrupt {
            name: std::any::type_name::<Self>().to_string(),
            reason: format!("failed to deserialize: {}", e),
        })
    }
}

/// Index of the largest value in each row (first one wins ties)
pub fn argmax_rows(scores: &Array2<f64>) -> Vec<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut best = 0;
            for (i, v) in row.iter().enumerate() {
                if *v > row[best] {
                    best = i;
                }
            }
            best
        })
        .collect()
}

/// Fraction of positions where the two slices agree
pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}
