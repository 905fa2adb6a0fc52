//! Incremental principal component analysis
//!
//! Batches update a running sum and scatter matrix, so memory is `O(d^2)`
//! regardless of the sample count. Components are extracted from the
//! resulting covariance by power iteration with deflation.

use canopy_core::{CanopyError, CanopyResult};
use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand::rngs::StdRng;

const POWER_ITERATIONS: usize = 200;
const POWER_TOL: f64 = 1e-10;

/// Accumulates batch statistics for a linear projection
#[derive(Debug, Clone)]
pub struct IncrementalPca {
    n_components: usize,
    seed: u64,
    count: usize,
    sum: Array1<f64>,
    scatter: Array2<f64>,
}

/// Fitted projection onto the top principal components
#[derive(Debug, Clone)]
pub struct PcaModel {
    mean: Array1<f64>,
    /// One component per row, unit length
    components: Array2<f64>,
    explained_variance: Vec<f64>,
}

impl IncrementalPca {
    /// `n_components` is capped at `dim`
    pub fn new(dim: usize, n_components: usize, seed: u64) -> Self {
        Self {
            n_components: n_components.clamp(1, dim.max(1)),
            seed,
            count: 0,
            sum: Array1::zeros(dim),
            scatter: Array2::zeros((dim, dim)),
        }
    }

    pub fn partial_fit(&mut self, batch: &Array2<f64>) {
        if batch.nrows() == 0 {
            return;
        }
        self.count += batch.nrows();
        self.sum += &batch.sum_axis(Axis(0));
        self.scatter += &batch.t().dot(batch);
    }

    pub fn samples_seen(&self) -> usize {
        self.count
    }

    pub fn finish(self) -> CanopyResult<PcaModel> {
        if self.count == 0 {
            return Err(CanopyError::validation("PCA fitted on zero samples"));
        }

        let n = self.count as f64;
        let mean = &self.sum / n;
        let column = mean.view().insert_axis(Axis(1));
        let mut covariance =
            (&self.scatter - &(column.dot(&column.t()) * n)) / (n - 1.0).max(1.0);

        let dim = mean.len();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut components = Array2::zeros((self.n_components, dim));
        let mut explained_variance = Vec::with_capacity(self.n_components);

        for c in 0..self.n_components {
            let vector = power_iteration(&covariance, &components, c, &mut rng);
            let eigenvalue = vector.dot(&covariance.dot(&vector)).max(0.0);

            let outer = vector
                .view()
                .insert_axis(Axis(1))
                .dot(&vector.view().insert_axis(Axis(0)));
            covariance -= &(outer * eigenvalue);

            components.row_mut(c).assign(&vector);
            explained_variance.push(eigenvalue);
        }

        Ok(PcaModel {
            mean,
            components,
            explained_variance,
        })
    }
}

/// Dominant eigenvector of `matrix`, orthogonal to the first `found` rows of `previous`
fn power_iteration(
    matrix: &Array2<f64>,
    previous: &Array2<f64>,
    found: usize,
    rng: &mut StdRng,
) -> Array1<f64> {
    let dim = matrix.nrows();
    let mut vector: Array1<f64> = (0..dim).map(|_| rng.random::<f64>() - 0.5).collect();
    orthogonalize(&mut vector, previous, found);
    normalize(&mut vector);

    for _ in 0..POWER_ITERATIONS {
        let mut next = matrix.dot(&vector);
        orthogonalize(&mut next, previous, found);
        if normalize(&mut next) < POWER_TOL {
            // Remaining variance is zero; any orthogonal direction will do
            break;
        }
        let delta = 1.0 - next.dot(&vector).abs();
        vector = next;
        if delta < POWER_TOL {
            break;
        }
    }

    // Fix the sign so equal inputs give equal projections
    let pivot = vector
        .iter()
        .copied()
        .fold(0.0f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
    if pivot < 0.0 {
        vector.mapv_inplace(|v| -v);
    }
    vector
}

fn orthogonalize(vector: &mut Array1<f64>, basis: &Array2<f64>, rows: usize) {
    for row in basis.rows().into_iter().take(rows) {
        let projection = vector.dot(&row);
        vector.scaled_add(-projection, &row);
    }
}

fn normalize(vector: &mut Array1<f64>) -> f64 {
    let norm = vector.dot(&*vector).sqrt();
    if norm > 0.0 {
        vector.mapv_inplace(|v| v / norm);
    }
    norm
}

impl PcaModel {
    /// Project a batch onto the fitted components
    pub fn transform(&self, batch: &Array2<f64>) -> Array2<f64> {
        let centered = batch - &self.mean;
        centered.dot(&self.components.t())
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn explained_variance(&self) -> &[f64] {
        &self.explained_variance
    }
}
