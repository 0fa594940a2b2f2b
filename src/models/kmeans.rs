//! Seeded k-means clustering (k-means++ initialization, Lloyd iterations)

use crate::error::{PipelineError, Result};
use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Fitted k-means model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeans {
    pub centroids: Vec<Vec<f64>>,
    pub iterations: usize,
    pub inertia: f64,
}

/// K-means hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct KMeansParams {
    pub n_clusters: usize,
    pub max_iterations: usize,
    /// Convergence threshold on the summed squared centroid shift
    pub tolerance: f64,
    pub seed: u64,
}

impl KMeansParams {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            max_iterations: 300,
            tolerance: 1e-4,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

impl KMeans {
    /// Fit on `data` and return the model with the label of every row.
    ///
    /// Fits `min(n_clusters, rows)` centroids, so fewer rows than clusters is
    /// not an error. Zero rows yields a model without centroids.
    pub fn fit(data: ArrayView2<'_, f64>, params: &KMeansParams) -> Result<(Self, Vec<usize>)> {
        if params.n_clusters == 0 {
            return Err(PipelineError::InvalidParameter {
                name: "n_clusters".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let n = data.nrows();
        if n == 0 {
            return Ok((
                Self {
                    centroids: Vec::new(),
                    iterations: 0,
                    inertia: 0.0,
                },
                Vec::new(),
            ));
        }

        let k = params.n_clusters.min(n);
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut centroids = init_plus_plus(data, k, &mut rng);
        let mut labels = vec![0usize; n];
        let mut iterations = 0;

        while iterations < params.max_iterations {
            iterations += 1;
            for (i, row) in data.outer_iter().enumerate() {
                labels[i] = nearest(&centroids, row).0;
            }

            let updated = recompute_centroids(data, &labels, &centroids);
            let shift: f64 = centroids
                .iter()
                .zip(&updated)
                .map(|(old, new)| squared_distance(old, new.iter().copied()))
                .sum();
            centroids = updated;

            if shift <= params.tolerance {
                break;
            }
        }

        let mut inertia = 0.0;
        for (i, row) in data.outer_iter().enumerate() {
            let (label, dist) = nearest(&centroids, row);
            labels[i] = label;
            inertia += dist;
        }

        Ok((
            Self {
                centroids,
                iterations,
                inertia,
            },
            labels,
        ))
    }

    pub fn n_clusters(&self) -> usize {
        self.centroids.len()
    }
}

/// Index of the centroid closest to `point`; ties go to the lowest index.
pub fn nearest_centroid(centroids: &[Vec<f64>], point: &[f64]) -> Option<usize> {
    centroids
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, squared_distance(c, point.iter().copied())))
        .fold(None, |best: Option<(usize, f64)>, (idx, dist)| match best {
            Some((_, best_dist)) if best_dist <= dist => best,
            _ => Some((idx, dist)),
        })
        .map(|(idx, _)| idx)
}

fn nearest(centroids: &[Vec<f64>], row: ArrayView1<'_, f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (idx, c) in centroids.iter().enumerate() {
        let dist = squared_distance(c, row.iter().copied());
        if dist < best.1 {
            best = (idx, dist);
        }
    }
    best
}

fn squared_distance(a: &[f64], b: impl Iterator<Item = f64>) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// k-means++ seeding: each further centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen centroid.
fn init_plus_plus(data: ArrayView2<'_, f64>, k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = data.nrows();
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(data.row(rng.gen_range(0..n)).to_vec());

    let mut min_dist: Vec<f64> = data
        .outer_iter()
        .map(|row| squared_distance(&centroids[0], row.iter().copied()))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_dist.iter().sum();
        let next = if total > 0.0 && total.is_finite() {
            let target = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = min_dist.iter().rposition(|d| *d > 0.0).unwrap_or(n - 1);
            for (i, d) in min_dist.iter().enumerate() {
                cumulative += d;
                if cumulative > target && *d > 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // Every remaining point coincides with a chosen centroid
            rng.gen_range(0..n)
        };

        let centroid = data.row(next).to_vec();
        for (i, row) in data.outer_iter().enumerate() {
            let d = squared_distance(&centroid, row.iter().copied());
            if d < min_dist[i] {
                min_dist[i] = d;
            }
        }
        centroids.push(centroid);
    }

    centroids
}

/// Mean of each cluster's rows; an empty cluster keeps its previous centroid.
fn recompute_centroids(
    data: ArrayView2<'_, f64>,
    labels: &[usize],
    previous: &[Vec<f64>],
) -> Vec<Vec<f64>> {
    let d = data.ncols();
    let mut sums = vec![vec![0.0; d]; previous.len()];
    let mut counts = vec![0usize; previous.len()];

    for (row, &label) in data.outer_iter().zip(labels) {
        counts[label] += 1;
        for (acc, v) in sums[label].iter_mut().zip(row.iter()) {
            *acc += v;
        }
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((sum, count), prev)| {
            if count == 0 {
                prev.clone()
            } else {
                sum.into_iter().map(|s| s / count as f64).collect()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, -0.1],
            [-0.1, 0.1],
            [10.0, 10.0],
            [10.1, 9.9],
            [9.9, 10.1],
        ]
    }

    #[test]
    fn test_separates_two_blobs() {
        let data = two_blobs();
        let (model, labels) = KMeans::fit(data.view(), &KMeansParams::new(2)).unwrap();

        assert_eq!(model.n_clusters(), 2);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
        assert!(model.inertia < 1.0);
    }

    #[test]
    fn test_fewer_rows_than_clusters() {
        let data = array![[0.0, 0.0], [1.0, 1.0], [5.0, 5.0]];
        let (model, labels) = KMeans::fit(data.view(), &KMeansParams::new(10)).unwrap();

        assert_eq!(model.n_clusters(), 3);
        assert_eq!(labels.len(), 3);
        assert!(labels.iter().all(|&l| l < 10));
        let mut distinct = labels.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_duplicate_rows_do_not_fail() {
        let data = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let (model, labels) = KMeans::fit(data.view(), &KMeansParams::new(3)).unwrap();
        assert_eq!(model.n_clusters(), 3);
        assert!(labels.iter().all(|&l| l < 3));
    }

    #[test]
    fn test_empty_input() {
        let data = Array2::<f64>::zeros((0, 2));
        let (model, labels) = KMeans::fit(data.view(), &KMeansParams::new(10)).unwrap();
        assert_eq!(model.n_clusters(), 0);
        assert!(labels.is_empty());
        assert_eq!(nearest_centroid(&model.centroids, &[0.0, 0.0]), None);
    }

    #[test]
    fn test_zero_clusters_rejected() {
        let data = two_blobs();
        assert!(KMeans::fit(data.view(), &KMeansParams::new(0)).is_err());
    }

    #[test]
    fn test_same_seed_same_assignment() {
        let data = two_blobs();
        let params = KMeansParams::new(3).with_seed(7);
        let (a, labels_a) = KMeans::fit(data.view(), &params).unwrap();
        let (b, labels_b) = KMeans::fit(data.view(), &params).unwrap();
        assert_eq!(labels_a, labels_b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_nearest_centroid_ties_pick_lowest_index() {
        let centroids = vec![vec![0.0, 0.0], vec![2.0, 0.0]];
        assert_eq!(nearest_centroid(&centroids, &[1.0, 0.0]), Some(0));
        assert_eq!(nearest_centroid(&centroids, &[1.5, 0.0]), Some(1));
    }
}
