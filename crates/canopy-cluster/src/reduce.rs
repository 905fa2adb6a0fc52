//! Neighbor-graph manifold reduction
//!
//! A UMAP-style projection:
//!
//! 1. k nearest neighbors of every point under cosine distance
//! 2. per-point smooth distances: `rho` is the closest neighbor distance and
//!    `sigma` is found by binary search so the memberships sum to `log2(k)`
//! 3. directed memberships combined by fuzzy union, `a + b - ab`
//! 4. a layout seeded from the leading principal components, refined by
//!    stochastic gradient descent with negative sampling under the curve
//!    `1 / (1 + a d^2b)` fitted to `min_dist`
//!
//! Every random draw comes from one seeded generator, so equal inputs give
//! equal layouts.

use crate::pca::IncrementalPca;
use canopy_core::{CanopyError, CanopyResult};
use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use tracing::debug;

const SPREAD: f64 = 1.0;
const NEGATIVE_SAMPLE_RATE: usize = 5;
const SIGMA_SEARCH_STEPS: usize = 64;
const SIGMA_TOL: f64 = 1e-5;
const MIN_SIGMA_SCALE: f64 = 1e-3;
const GRADIENT_CLIP: f64 = 4.0;
const INITIAL_EXTENT: f64 = 10.0;

/// Weighted undirected edge of the neighbor graph
#[derive(Debug, Clone, Copy, PartialEq)]
struct Edge {
    head: usize,
    tail: usize,
    weight: f64,
}

#[derive(Debug, Clone)]
pub struct ManifoldReducer {
    n_neighbors: usize,
    n_components: usize,
    min_dist: f64,
    epochs: usize,
    seed: u64,
}

impl ManifoldReducer {
    pub fn new(
        n_neighbors: usize,
        n_components: usize,
        min_dist: f64,
        epochs: usize,
        seed: u64,
    ) -> Self {
        Self {
            n_neighbors: n_neighbors.max(1),
            n_components: n_components.max(1),
            min_dist,
            epochs,
            seed,
        }
    }

    /// Project the rows of `data` to `n_components` dimensions
    pub fn fit_transform(&self, data: &Array2<f64>) -> CanopyResult<Array2<f64>> {
        let n = data.nrows();
        if n < 2 {
            return Err(CanopyError::validation(format!(
                "manifold reduction needs at least 2 points, got {n}"
            )));
        }

        let k = self.n_neighbors.min(n - 1);
        let neighbors = cosine_neighbors(data, k);
        let edges = fuzzy_union(&neighbors, k);
        let (a, b) = fit_curve(self.min_dist);
        debug!(
            points = n,
            neighbors = k,
            edges = edges.len(),
            a,
            b,
            "Built neighbor graph"
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut layout = self.initial_layout(data, &mut rng)?;
        self.optimize(&mut layout, &edges, a, b, &mut rng);
        Ok(layout)
    }

    /// Leading principal components scaled into `[-10, 10]`, plus jitter
    fn initial_layout(&self, data: &Array2<f64>, rng: &mut StdRng) -> CanopyResult<Array2<f64>> {
        let n = data.nrows();
        let mut pca = IncrementalPca::new(data.ncols(), self.n_components, self.seed);
        pca.partial_fit(data);
        let projected = pca.finish()?.transform(data);

        let mut layout = Array2::zeros((n, self.n_components));
        for (c, column) in projected.axis_iter(Axis(1)).enumerate() {
            let extent = column.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
            let scale = if extent > 0.0 { INITIAL_EXTENT / extent } else { 0.0 };
            for (i, value) in column.iter().enumerate() {
                layout[[i, c]] = value * scale;
            }
        }
        // Jitter breaks ties and fills columns beyond the input dimension
        for value in layout.iter_mut() {
            *value += (rng.random::<f64>() - 0.5) * 1e-4 * INITIAL_EXTENT;
        }
        Ok(layout)
    }

    fn optimize(
        &self,
        layout: &mut Array2<f64>,
        edges: &[Edge],
        a: f64,
        b: f64,
        rng: &mut StdRng,
    ) {
        let Some(max_weight) = edges.iter().map(|e| e.weight).reduce(f64::max) else {
            return;
        };
        let n = layout.nrows();
        let epochs = self.epochs as f64;

        // Heavier edges are sampled more often
        let epochs_per_sample: Vec<f64> = edges.iter().map(|e| max_weight / e.weight).collect();
        let epochs_per_negative: Vec<f64> = epochs_per_sample
            .iter()
            .map(|eps| eps / NEGATIVE_SAMPLE_RATE as f64)
            .collect();
        let mut next_sample = epochs_per_sample.clone();
        let mut next_negative = epochs_per_negative.clone();

        for epoch in 0..self.epochs {
            let now = epoch as f64;
            let alpha = 1.0 - now / epochs;

            for (e, edge) in edges.iter().enumerate() {
                if next_sample[e] > now {
                    continue;
                }
                attract(layout, edge.head, edge.tail, a, b, alpha);
                next_sample[e] += epochs_per_sample[e];

                let negatives =
                    ((now - next_negative[e]) / epochs_per_negative[e]).max(0.0) as usize;
                for _ in 0..negatives {
                    let other = rng.random_range(0..n);
                    if other != edge.head {
                        repel(layout, edge.head, other, a, b, alpha);
                    }
                }
                next_negative[e] += negatives as f64 * epochs_per_negative[e];
            }
        }
    }
}

/// The `k` nearest other points of every row by cosine distance, closest first
fn cosine_neighbors(data: &Array2<f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let mut unit = data.to_owned();
    for mut row in unit.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }

    let mut neighbors = Vec::with_capacity(unit.nrows());
    for (i, row) in unit.rows().into_iter().enumerate() {
        let similarity: Array1<f64> = unit.dot(&row);
        let mut candidates: Vec<(usize, f64)> = similarity
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, s)| (j, (1.0 - s).clamp(0.0, 2.0)))
            .collect();
        candidates.sort_by(|x, y| x.1.total_cmp(&y.1).then(x.0.cmp(&y.0)));
        candidates.truncate(k);
        neighbors.push(candidates);
    }
    neighbors
}

/// Symmetric fuzzy membership graph from directed neighbor lists
fn fuzzy_union(neighbors: &[Vec<(usize, f64)>], k: usize) -> Vec<Edge> {
    let target = (k as f64).log2();
    let mut directed: BTreeMap<(usize, usize), f64> = BTreeMap::new();

    for (i, list) in neighbors.iter().enumerate() {
        let distances: Vec<f64> = list.iter().map(|(_, d)| *d).collect();
        let rho = distances.iter().copied().find(|d| *d > 0.0).unwrap_or(0.0);
        let sigma = smooth_sigma(&distances, rho, target);
        for (j, d) in list {
            directed.insert((i, *j), membership(*d, rho, sigma));
        }
    }

    let mut edges = Vec::new();
    for (&(i, j), &forward) in &directed {
        if i > j && directed.contains_key(&(j, i)) {
            // Already merged when the pair was seen as (j, i)
            continue;
        }
        let backward = directed.get(&(j, i)).copied().unwrap_or(0.0);
        let weight = forward + backward - forward * backward;
        if weight > 0.0 {
            edges.push(Edge {
                head: i.min(j),
                tail: i.max(j),
                weight,
            });
        }
    }
    edges
}

fn membership(distance: f64, rho: f64, sigma: f64) -> f64 {
    let excess = distance - rho;
    if excess <= 0.0 {
        1.0
    } else if sigma > 0.0 {
        (-excess / sigma).exp()
    } else {
        0.0
    }
}

/// Bandwidth whose memberships over `distances` sum to `target`
fn smooth_sigma(distances: &[f64], rho: f64, target: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0;

    for _ in 0..SIGMA_SEARCH_STEPS {
        let total: f64 = distances.iter().map(|d| membership(*d, rho, mid)).sum();
        if (total - target).abs() < SIGMA_TOL {
            break;
        }
        if total > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }

    let mean = distances.iter().sum::<f64>() / distances.len().max(1) as f64;
    mid.max(MIN_SIGMA_SCALE * mean)
}

/// Fit `a`, `b` so `1 / (1 + a x^2b)` approximates the offset exponential
///
/// Coarse grid search followed by a finer grid around the best pair.
pub(crate) fn fit_curve(min_dist: f64) -> (f64, f64) {
    let xs: Vec<f64> = (0..300).map(|i| i as f64 * 3.0 * SPREAD / 299.0).collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|x| {
            if *x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / SPREAD).exp()
            }
        })
        .collect();
    let error = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(x, y)| (1.0 / (1.0 + a * x.powf(2.0 * b)) - y).powi(2))
            .sum()
    };

    let mut best = (1.0, 1.0);
    let mut best_error = f64::INFINITY;
    let mut search = |a_values: Vec<f64>, b_values: Vec<f64>, best: &mut (f64, f64)| {
        for &a in &a_values {
            for &b in &b_values {
                let e = error(a, b);
                if e < best_error {
                    best_error = e;
                    *best = (a, b);
                }
            }
        }
    };

    search(
        (1..=100).map(|i| i as f64 * 0.05).collect(),
        (5..=100).map(|i| i as f64 * 0.02).collect(),
        &mut best,
    );
    let (a0, b0) = best;
    search(
        (-10..=10).map(|i| a0 + i as f64 * 0.005).filter(|a| *a > 0.0).collect(),
        (-10..=10).map(|i| b0 + i as f64 * 0.002).filter(|b| *b > 0.0).collect(),
        &mut best,
    );
    best
}

fn clip(value: f64) -> f64 {
    value.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

fn attract(layout: &mut Array2<f64>, i: usize, j: usize, a: f64, b: f64, alpha: f64) {
    let dim = layout.ncols();
    let dist2: f64 = (0..dim).map(|d| (layout[[i, d]] - layout[[j, d]]).powi(2)).sum();
    if dist2 <= 0.0 {
        return;
    }
    let coeff = -2.0 * a * b * dist2.powf(b - 1.0) / (a * dist2.powf(b) + 1.0);
    for d in 0..dim {
        let grad = clip(coeff * (layout[[i, d]] - layout[[j, d]])) * alpha;
        layout[[i, d]] += grad;
        layout[[j, d]] -= grad;
    }
}

fn repel(layout: &mut Array2<f64>, i: usize, k: usize, a: f64, b: f64, alpha: f64) {
    let dim = layout.ncols();
    let dist2: f64 = (0..dim).map(|d| (layout[[i, d]] - layout[[k, d]]).powi(2)).sum();
    if dist2 <= 0.0 {
        return;
    }
    let coeff = 2.0 * b / ((0.001 + dist2) * (a * dist2.powf(b) + 1.0));
    for d in 0..dim {
        let grad = clip(coeff * (layout[[i, d]] - layout[[k, d]])) * alpha;
        layout[[i, d]] += grad;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(per_blob: usize) -> Array2<f64> {
        let mut data = Array2::zeros((per_blob * 2, 4));
        for i in 0..per_blob * 2 {
            let axis = if i < per_blob { 0 } else { 2 };
            data[[i, axis]] = 1.0;
            data[[i, axis + 1]] = 0.05 * (i % per_blob) as f64;
        }
        data
    }

    #[test]
    fn test_fit_curve_matches_known_parameters() {
        // Reference values for min_dist = 0.1, spread = 1.0
        let (a, b) = fit_curve(0.1);
        assert!((a - 1.577).abs() < 0.1, "a = {a}");
        assert!((b - 0.895).abs() < 0.05, "b = {b}");
    }

    #[test]
    fn test_neighbors_exclude_self_and_sort() {
        let data = blobs(4);
        let neighbors = cosine_neighbors(&data, 3);
        for (i, list) in neighbors.iter().enumerate() {
            assert_eq!(list.len(), 3);
            assert!(list.iter().all(|(j, _)| *j != i));
            assert!(list.windows(2).all(|w| w[0].1 <= w[1].1));
            // Nearest neighbors stay within the blob
            assert!(list.iter().all(|(j, _)| (*j < 4) == (i < 4)));
        }
    }

    #[test]
    fn test_union_edges_are_symmetric_and_bounded() {
        let data = blobs(5);
        let edges = fuzzy_union(&cosine_neighbors(&data, 3), 3);
        assert!(!edges.is_empty());
        for edge in &edges {
            assert!(edge.head < edge.tail);
            assert!(edge.weight > 0.0 && edge.weight <= 1.0);
        }
    }

    #[test]
    fn test_layout_is_deterministic_and_keeps_blobs_apart() {
        let data = blobs(6);
        let reducer = ManifoldReducer::new(3, 2, 0.1, 100, 7);
        let first = reducer.fit_transform(&data).unwrap();
        let second = reducer.fit_transform(&data).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.dim(), (12, 2));

        let centroid = |range: std::ops::Range<usize>| -> Array1<f64> {
            let len = range.len() as f64;
            range.fold(Array1::zeros(2), |acc, i| acc + &first.row(i)) / len
        };
        let spread = |range: std::ops::Range<usize>, center: &Array1<f64>| -> f64 {
            range
                .map(|i| (&first.row(i) - center).mapv(|v| v * v).sum().sqrt())
                .fold(0.0, f64::max)
        };
        let left = centroid(0..6);
        let right = centroid(6..12);
        let gap = (&left - &right).mapv(|v| v * v).sum().sqrt();
        assert!(gap > spread(0..6, &left));
        assert!(gap > spread(6..12, &right));
    }

    #[test]
    fn test_single_point_rejected() {
        let reducer = ManifoldReducer::new(2, 2, 0.1, 10, 0);
        assert!(reducer.fit_transform(&Array2::zeros((1, 3))).is_err());
    }
}
