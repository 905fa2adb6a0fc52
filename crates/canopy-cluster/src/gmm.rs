//! Gaussian mixture model with diagonal covariances
//!
//! Fitted by expectation maximization:
//!
//! ```text
//! E-step: γₙₖ = πₖ N(xₙ | μₖ, σ²ₖ) / Σⱼ πⱼ N(xₙ | μⱼ, σ²ⱼ)
//! M-step: πₖ = Nₖ / N,  μₖ = Σₙ γₙₖ xₙ / Nₖ,  σ²ₖ = Σₙ γₙₖ (xₙ - μₖ)² / Nₖ + reg
//! ```
//!
//! `reg` is relative: `reg_covar` times the mean per-dimension variance of
//! the data, never below [`MIN_VARIANCE`]. No component can shrink onto a
//! single point, whatever the scale of the input.
//!
//! Responsibilities are computed in log space with log-sum-exp. Iteration
//! stops when the mean log-likelihood improves by less than `tol`.
//!
//! The component count is chosen by the Bayesian information criterion,
//! `BIC = -2 ln L + p ln N`, where `p` counts means, variances and the
//! free mixing weights.

use crate::kmeans::kmeans_plus_plus;
use canopy_core::{CanopyError, CanopyResult};
use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;
use rand::rngs::StdRng;
use tracing::debug;

/// Absolute variance floor, used when the data has (almost) no spread
pub const MIN_VARIANCE: f64 = 1e-6;

/// Default variance floor as a fraction of the data's mean variance
pub const DEFAULT_REG_COVAR: f64 = 1e-2;

/// Mixture configuration
#[derive(Debug, Clone)]
pub struct Gmm {
    n_components: usize,
    max_iter: usize,
    tol: f64,
    seed: u64,
    reg_covar: f64,
}

/// Fitted mixture parameters
#[derive(Debug, Clone)]
pub struct GmmModel {
    weights: Array1<f64>,
    means: Array2<f64>,
    variances: Array2<f64>,
    log_likelihood: f64,
    converged: bool,
    n_iter: usize,
}

impl Gmm {
    pub fn new() -> Self {
        Self {
            n_components: 1,
            max_iter: 100,
            tol: 1e-3,
            seed: 0,
            reg_covar: DEFAULT_REG_COVAR,
        }
    }

    pub fn with_n_components(mut self, n: usize) -> Self {
        self.n_components = n;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Variance floor relative to the data's mean per-dimension variance
    pub fn with_reg_covar(mut self, reg_covar: f64) -> Self {
        self.reg_covar = reg_covar;
        self
    }

    /// Variance added to every component for `data` with per-dimension variance `spread`
    fn variance_floor(&self, spread: &Array1<f64>) -> f64 {
        let mean = spread.mean().unwrap_or(0.0);
        (self.reg_covar * mean).max(MIN_VARIANCE)
    }

    /// Run EM on the rows of `data`
    pub fn fit(&self, data: &Array2<f64>) -> CanopyResult<GmmModel> {
        let n = data.nrows();
        let d = data.ncols();
        let k = self.n_components;
        if n == 0 {
            return Err(CanopyError::validation("mixture fitted on zero samples"));
        }
        if k == 0 || k > n {
            return Err(CanopyError::configuration(format!(
                "mixture needs 1..={n} components, got {k}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let means = kmeans_plus_plus(data, k, &mut rng);

        // Start every component with the overall per-dimension variance
        let global_mean = data.sum_axis(ndarray::Axis(0)) / n as f64;
        let mut global_var = Array1::<f64>::zeros(d);
        for row in data.rows() {
            for j in 0..d {
                global_var[j] += (row[j] - global_mean[j]).powi(2);
            }
        }
        global_var.mapv_inplace(|v| v / n as f64);
        let floor = self.variance_floor(&global_var);
        global_var.mapv_inplace(|v| v + floor);
        let mut variances = Array2::zeros((k, d));
        for mut row in variances.rows_mut() {
            row.assign(&global_var);
        }

        let mut model = GmmModel {
            weights: Array1::from_elem(k, 1.0 / k as f64),
            means,
            variances,
            log_likelihood: f64::NEG_INFINITY,
            converged: false,
            n_iter: 0,
        };

        let mut previous = f64::NEG_INFINITY;
        for iter in 0..self.max_iter {
            let (resp, total) = model.e_step(data);
            let mean_ll = total / n as f64;
            model.n_iter = iter + 1;
            if (mean_ll - previous).abs() < self.tol {
                model.converged = true;
                break;
            }
            previous = mean_ll;
            m_step(&mut model, data, &resp, floor);
        }

        let (_, total) = model.e_step(data);
        model.log_likelihood = total;
        Ok(model)
    }
}

impl Default for Gmm {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-estimate weights, means and floored variances from responsibilities
fn m_step(model: &mut GmmModel, data: &Array2<f64>, resp: &Array2<f64>, floor: f64) {
    let n = data.nrows();
    let d = data.ncols();
    let k = model.weights.len();

    for c in 0..k {
        let column = resp.column(c);
        let nk = column.sum() + 10.0 * f64::EPSILON;
        model.weights[c] = nk / n as f64;

        let mut mean = Array1::<f64>::zeros(d);
        for (i, row) in data.rows().into_iter().enumerate() {
            mean.scaled_add(column[i], &row);
        }
        mean /= nk;

        let mut variance = Array1::<f64>::zeros(d);
        for (i, row) in data.rows().into_iter().enumerate() {
            for j in 0..d {
                variance[j] += column[i] * (row[j] - mean[j]).powi(2);
            }
        }
        variance.mapv_inplace(|v| v / nk + floor);

        model.means.row_mut(c).assign(&mean);
        model.variances.row_mut(c).assign(&variance);
    }
}

impl GmmModel {
    /// Per-row responsibilities and the total log-likelihood
    fn e_step(&self, data: &Array2<f64>) -> (Array2<f64>, f64) {
        let n = data.nrows();
        let k = self.weights.len();
        let mut resp = Array2::zeros((n, k));
        let mut total = 0.0;
        let mut log_probs = vec![0.0; k];

        for (i, row) in data.rows().into_iter().enumerate() {
            for (c, slot) in log_probs.iter_mut().enumerate() {
                *slot = self.weights[c].ln()
                    + log_gaussian(&row, &self.means.row(c), &self.variances.row(c));
            }
            let log_norm = logsumexp(&log_probs);
            total += log_norm;
            for c in 0..k {
                resp[[i, c]] = (log_probs[c] - log_norm).exp();
            }
        }
        (resp, total)
    }

    /// Membership probability of every row in every component
    pub fn predict_proba(&self, data: &Array2<f64>) -> Array2<f64> {
        self.e_step(data).0
    }

    /// Bayesian information criterion for `n_samples` points; lower is better
    pub fn bic(&self, n_samples: usize) -> f64 {
        let k = self.weights.len() as f64;
        let d = self.means.ncols() as f64;
        let parameters = 2.0 * k * d + (k - 1.0);
        -2.0 * self.log_likelihood + parameters * (n_samples as f64).ln()
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }
}

/// Fit `1..=max_components` mixtures and keep the lowest BIC
///
/// Ties go to the smaller model.
pub fn select_by_bic(
    gmm: &Gmm,
    data: &Array2<f64>,
    max_components: usize,
) -> CanopyResult<GmmModel> {
    let n = data.nrows();
    let upper = max_components.clamp(1, n.max(1));
    let mut best: Option<(f64, GmmModel)> = None;

    for k in 1..=upper {
        let model = gmm.clone().with_n_components(k).fit(data)?;
        let bic = model.bic(n);
        debug!(
            components = k,
            bic,
            converged = model.converged,
            iterations = model.n_iter,
            "Fitted mixture candidate"
        );
        let better = match &best {
            Some((best_bic, _)) => bic < *best_bic,
            None => true,
        };
        if better {
            best = Some((bic, model));
        }
    }

    best.map(|(_, model)| model)
        .ok_or_else(|| CanopyError::invariant("no mixture candidates were fitted"))
}

fn log_gaussian(
    point: &ArrayView1<'_, f64>,
    mean: &ArrayView1<'_, f64>,
    var: &ArrayView1<'_, f64>,
) -> f64 {
    let d = point.len() as f64;
    let mut log_prob = -0.5 * d * (2.0 * std::f64::consts::PI).ln();
    for i in 0..point.len() {
        let diff = point[i] - mean[i];
        log_prob -= 0.5 * var[i].ln();
        log_prob -= 0.5 * diff * diff / var[i];
    }
    log_prob
}

fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Ten points on a small circle around each of two far apart centers
    fn two_blobs() -> Array2<f64> {
        let mut data = Array2::zeros((20, 2));
        for i in 0..20 {
            let center = if i < 10 { 0.0 } else { 8.0 };
            let angle = (i % 10) as f64 * std::f64::consts::TAU / 10.0;
            data[[i, 0]] = center + 0.5 * angle.cos();
            data[[i, 1]] = center + 0.5 * angle.sin();
        }
        data
    }

    #[test]
    fn test_two_components_split_blobs() {
        let data = two_blobs();
        let model = Gmm::new().with_n_components(2).with_seed(42).fit(&data).unwrap();
        let proba = model.predict_proba(&data);

        let label = |i: usize| if proba[[i, 0]] > proba[[i, 1]] { 0 } else { 1 };
        assert!((0..10).all(|i| label(i) == label(0)));
        assert!((10..20).all(|i| label(i) == label(10)));
        assert_ne!(label(0), label(10));
    }

    #[test]
    fn test_responsibilities_sum_to_one() {
        let data = array![[0.0, 0.0], [5.0, 5.0], [10.0, 10.0]];
        let model = Gmm::new().with_n_components(2).with_seed(1).fit(&data).unwrap();
        for row in model.predict_proba(&data).rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bic_prefers_two_components_for_two_blobs() {
        let data = two_blobs();
        let model = select_by_bic(&Gmm::new().with_seed(42), &data, 3).unwrap();
        assert_eq!(model.n_components(), 2);
    }

    #[test]
    fn test_duplicated_points_do_not_get_a_component_each() {
        let data = Array2::from_shape_vec(
            (12, 1),
            vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 5.0, 5.0],
        )
        .unwrap();
        let model = select_by_bic(&Gmm::new().with_seed(7), &data, 6).unwrap();
        assert_eq!(model.n_components(), 1);
    }

    #[test]
    fn test_identical_points_fit_one_component() {
        let data = Array2::from_elem((10, 3), 0.25);
        let model = select_by_bic(&Gmm::new().with_seed(3), &data, 4).unwrap();
        assert_eq!(model.n_components(), 1);
        assert!(model.log_likelihood().is_finite());
    }

    #[test]
    fn test_variance_floor_follows_data_scale() {
        let gmm = Gmm::new();
        let floor = gmm.variance_floor(&array![100.0, 300.0]);
        assert!((floor - 2.0).abs() < 1e-12);
        assert_eq!(gmm.variance_floor(&array![0.0, 0.0]), MIN_VARIANCE);
    }

    #[test]
    fn test_too_many_components_rejected() {
        let data = array![[0.0], [1.0]];
        assert!(Gmm::new().with_n_components(3).fit(&data).is_err());
        assert!(Gmm::new().with_n_components(0).fit(&data).is_err());
    }

    #[test]
    fn test_logsumexp_is_stable() {
        let value = logsumexp(&[1000.0, 1000.0]);
        assert!((value - (1000.0 + 2.0f64.ln())).abs() < 1e-9);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }
}
