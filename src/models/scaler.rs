//! Z-score standardization with persisted fit statistics

use crate::error::{PipelineError, Result};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Column-wise standardizer using population (ddof = 0) statistics.
///
/// Columns with zero variance keep a scale of 1, so they standardize to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
    pub n_samples: usize,
}

impl StandardScaler {
    /// Fit column statistics over every row of `data`.
    pub fn fit(data: ArrayView2<'_, f64>) -> Self {
        let n = data.nrows();
        let d = data.ncols();
        if n == 0 {
            return Self {
                mean: vec![0.0; d],
                scale: vec![1.0; d],
                n_samples: 0,
            };
        }

        let mut mean = Vec::with_capacity(d);
        let mut scale = Vec::with_capacity(d);
        for column in data.axis_iter(Axis(1)) {
            let m = column.sum() / n as f64;
            let var = column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n as f64;
            let std = var.sqrt();
            mean.push(m);
            scale.push(if std > 0.0 && std.is_finite() { std } else { 1.0 });
        }

        Self {
            mean,
            scale,
            n_samples: n,
        }
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if data.ncols() != self.n_features() {
            return Err(PipelineError::InvalidParameter {
                name: "data".to_string(),
                reason: format!(
                    "expected {} feature columns, got {}",
                    self.n_features(),
                    data.ncols()
                ),
            });
        }

        let mut out = data.to_owned();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[j], self.scale[j]);
            column.mapv_inplace(|v| (v - m) / s);
        }
        Ok(out)
    }

    /// Standardize a single feature vector.
    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        if row.len() != self.n_features() {
            return Err(PipelineError::InvalidParameter {
                name: "row".to_string(),
                reason: format!(
                    "expected {} features, got {}",
                    self.n_features(),
                    row.len()
                ),
            });
        }
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect())
    }
}
