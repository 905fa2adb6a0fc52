//! K-means++ seeding and mini-batch k-means
//!
//! Mini-batch k-means (Sculley, 2010) updates each centroid with a per-centroid
//! learning rate of `1 / count`, so a centroid that has absorbed many points
//! moves less. Batches are fed one at a time and the full dataset is never
//! needed at once.

use crate::matrix::{nearest, squared_distance};
use canopy_core::{CanopyError, CanopyResult};
use ndarray::Array2;
use rand::prelude::*;

/// Pick `k` initial centroids from `data` with k-means++ spreading
///
/// The first centroid is uniform; each next one is sampled with probability
/// proportional to its squared distance from the closest chosen centroid.
pub fn kmeans_plus_plus(data: &Array2<f64>, k: usize, rng: &mut impl Rng) -> Array2<f64> {
    let n = data.nrows();
    let d = data.ncols();
    let mut centroids = Array2::zeros((k, d));
    if n == 0 || k == 0 {
        return centroids;
    }

    let first = rng.random_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));
    let mut min_dist: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|row| squared_distance(&row, &centroids.row(0)))
        .collect();

    for i in 1..k {
        let total: f64 = min_dist.iter().sum();
        let selected = if total <= 0.0 {
            rng.random_range(0..n)
        } else {
            let threshold = rng.random::<f64>() * total;
            let mut cumsum = 0.0;
            let mut selected = n - 1;
            for (j, &dist) in min_dist.iter().enumerate() {
                cumsum += dist;
                if cumsum >= threshold {
                    selected = j;
                    break;
                }
            }
            selected
        };

        centroids.row_mut(i).assign(&data.row(selected));
        for (j, row) in data.rows().into_iter().enumerate() {
            let dist = squared_distance(&row, &centroids.row(i));
            if dist < min_dist[j] {
                min_dist[j] = dist;
            }
        }
    }

    centroids
}

/// Online k-means fitted one batch at a time
#[derive(Debug, Clone)]
pub struct MiniBatchKMeans {
    centroids: Array2<f64>,
    counts: Vec<u64>,
}

impl MiniBatchKMeans {
    /// Seed `k` centroids from `sample` with k-means++
    pub fn init(sample: &Array2<f64>, k: usize, rng: &mut impl Rng) -> CanopyResult<Self> {
        if k == 0 {
            return Err(CanopyError::configuration("k-means needs at least one cluster"));
        }
        if sample.nrows() < k {
            return Err(CanopyError::validation(format!(
                "k-means seeding needs {k} samples, got {}",
                sample.nrows()
            )));
        }
        Ok(Self {
            centroids: kmeans_plus_plus(sample, k, rng),
            counts: vec![0; k],
        })
    }

    /// Move each assigned centroid toward the batch points
    pub fn partial_fit(&mut self, batch: &Array2<f64>) {
        let labels = self.predict(batch);
        for (row, label) in batch.rows().into_iter().zip(labels) {
            self.counts[label] += 1;
            let eta = 1.0 / self.counts[label] as f64;
            let mut centroid = self.centroids.row_mut(label);
            centroid.zip_mut_with(&row, |c, x| *c = (1.0 - eta) * *c + eta * x);
        }
    }

    /// Nearest-centroid label of every batch row
    pub fn predict(&self, batch: &Array2<f64>) -> Vec<usize> {
        batch
            .rows()
            .into_iter()
            .map(|row| nearest(&row, &self.centroids))
            .collect()
    }

    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    pub fn centroids(&self) -> &Array2<f64> {
        &self.centroids
    }
}
