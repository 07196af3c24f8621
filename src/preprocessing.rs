// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Per-feature standardization fitted on the training subset only

use crate::error::{PipelineError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// z-score scaler: `(x - mean) / std`, parameters frozen after `fit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
    feature_names: Vec<String>,
}

impl StandardScaler {
    /// Learn per-column mean and population standard deviation
    ///
    /// Constant columns get a scale of 1 so they map to 0 instead of NaN.
    pub fn fit(x: &Array2<f64>, feature_names: &[String]) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(PipelineError::TrainingFailed(
                "cannot fit a scaler on an empty training subset".to_string(),
            ));
        }
        if feature_names.len() != x.ncols() {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} feature names", x.ncols()),
                actual: format!("{}", feature_names.len()),
            });
        }

        let mean = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });

        Ok(Self {
            mean,
            scale,
            feature_names: feature_names.to_vec(),
        })
    }

    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.mean.len() {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} features", self.mean.len()),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok((x - &self.mean) / &self.scale)
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }
}
