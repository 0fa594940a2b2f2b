//! Isolation Forest outlier detection
//!
//! Anomalies need fewer random splits to isolate, so their average path
//! length is shorter and their score `2^(-E[h(x)] / c(n))` is higher.
//! Trees are grown from a seeded `StdRng`, which makes fitted models and
//! their labels reproducible for identical input.

use crate::error::{PipelineError, Result};
use crate::types::AnomalyLabel;
use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Score of a point that no split can separate from the rest.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Scores within this distance of [`NEUTRAL_SCORE`] count as neutral.
const SCORE_EPSILON: f64 = 1e-9;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum IsolationNode {
    Internal {
        feature: usize,
        threshold: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    root: IsolationNode,
}

impl IsolationTree {
    fn build(
        data: ArrayView2<'_, f64>,
        indices: Vec<usize>,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            root: Self::build_node(data, indices, 0, max_depth, rng),
        }
    }

    fn build_node(
        data: ArrayView2<'_, f64>,
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> IsolationNode {
        if depth >= max_depth || indices.len() <= 1 {
            return IsolationNode::Leaf {
                size: indices.len(),
            };
        }

        // Only features that still vary can split this node
        let splittable: Vec<(usize, f64, f64)> = (0..data.ncols())
            .filter_map(|feature| {
                let (min, max) = indices.iter().fold(
                    (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo, hi), &i| (lo.min(data[[i, feature]]), hi.max(data[[i, feature]])),
                );
                (max > min).then_some((feature, min, max))
            })
            .collect();

        if splittable.is_empty() {
            return IsolationNode::Leaf {
                size: indices.len(),
            };
        }

        let (feature, min, max) = splittable[rng.gen_range(0..splittable.len())];
        let threshold = rng.gen_range(min..max);

        let size = indices.len();
        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| data[[i, feature]] < threshold);

        if left.is_empty() || right.is_empty() {
            return IsolationNode::Leaf { size };
        }

        IsolationNode::Internal {
            feature,
            threshold,
            left: Box::new(Self::build_node(data, left, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(data, right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;
        loop {
            match node {
                IsolationNode::Leaf { size } => return depth as f64 + average_path_length(*size),
                IsolationNode::Internal {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if sample[*feature] < *threshold {
                        left
                    } else {
                        right
                    };
                    depth += 1;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Isolation forest hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IsolationForestParams {
    pub n_estimators: usize,
    /// Rows drawn (without replacement) per tree, capped at the dataset size
    pub max_samples: usize,
    /// Expected fraction of anomalous rows; sets the decision threshold
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.001,
            seed: 42,
        }
    }
}

impl IsolationForestParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(PipelineError::InvalidParameter {
                name: "n_estimators".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_samples == 0 {
            return Err(PipelineError::InvalidParameter {
                name: "max_samples".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(PipelineError::InvalidParameter {
                name: "contamination".to_string(),
                reason: format!("must be in (0, 0.5], got {}", self.contamination),
            });
        }
        Ok(())
    }
}

/// A fitted isolation forest with its contamination-derived threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    pub params: IsolationForestParams,
    pub n_features: usize,
    pub sample_size: usize,
    pub threshold: f64,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    /// Grow the forest on `data` and derive the decision threshold.
    pub fn fit(data: ArrayView2<'_, f64>, params: IsolationForestParams) -> Result<Self> {
        params.validate()?;
        let n = data.nrows();
        if n == 0 {
            return Err(PipelineError::InvalidParameter {
                name: "data".to_string(),
                reason: "cannot fit on zero rows".to_string(),
            });
        }

        let sample_size = params.max_samples.min(n);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.n_estimators)
            .map(|_| {
                let indices = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
                IsolationTree::build(data, indices, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            params,
            n_features: data.ncols(),
            sample_size,
            threshold: f64::INFINITY,
            trees,
        };

        let scores = forest.score_samples(data)?;
        forest.threshold = quantile(&scores, 1.0 - params.contamination);
        Ok(forest)
    }

    /// Anomaly score in (0, 1]; higher is more isolated.
    pub fn score(&self, sample: &[f64]) -> Result<f64> {
        if sample.len() != self.n_features {
            return Err(PipelineError::InvalidParameter {
                name: "sample".to_string(),
                reason: format!(
                    "expected {} features, got {}",
                    self.n_features,
                    sample.len()
                ),
            });
        }

        let c = average_path_length(self.sample_size);
        if c <= 0.0 || self.trees.is_empty() {
            return Ok(NEUTRAL_SCORE);
        }

        let mean_path = self
            .trees
            .iter()
            .map(|tree| tree.path_length(sample))
            .sum::<f64>()
            / self.trees.len() as f64;

        Ok(2.0_f64.powf(-mean_path / c))
    }

    pub fn score_samples(&self, data: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        data.outer_iter()
            .map(|row| self.score(&row.to_vec()))
            .collect()
    }

    /// Label a single feature vector.
    pub fn predict(&self, sample: &[f64]) -> Result<AnomalyLabel> {
        Ok(self.label_for(self.score(sample)?))
    }

    pub fn predict_batch(&self, data: ArrayView2<'_, f64>) -> Result<Vec<AnomalyLabel>> {
        Ok(self
            .score_samples(data)?
            .into_iter()
            .map(|s| self.label_for(s))
            .collect())
    }

    /// A score is anomalous when it reaches the contamination threshold and
    /// is more isolated than a point no split can separate.
    fn label_for(&self, score: f64) -> AnomalyLabel {
        if score >= self.threshold && score > NEUTRAL_SCORE + SCORE_EPSILON {
            AnomalyLabel::Anomaly
        } else {
            AnomalyLabel::Normal
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

/// Linearly interpolated quantile of `values` (`q` in [0, 1]).
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}
