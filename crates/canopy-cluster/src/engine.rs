//! The clustering policy applied to one level of embeddings

use crate::gmm::{select_by_bic, Gmm};
use crate::kmeans::MiniBatchKMeans;
use crate::matrix::{centroid_of, to_matrix, validate_embeddings};
use crate::pca::IncrementalPca;
use crate::reduce::ManifoldReducer;
use canopy_core::config::ClusteringConfig;
use canopy_core::{CanopyResult, Cluster, Clusterer};
use ndarray::Array2;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::time::Instant;
use tracing::{debug, info};

/// Partitions embeddings into clusters
///
/// - at most `small_input_floor` points: one cluster, no model is fitted
/// - up to `large_scale_threshold` points: manifold reduction, Gaussian
///   mixture, soft assignment (a point may join several clusters)
/// - above it, or with `algorithm = "kmeans"`: incremental PCA and
///   mini-batch k-means over `batch_size` batches, one cluster per point
#[derive(Debug, Clone)]
pub struct ClusteringEngine {
    config: ClusteringConfig,
}

impl ClusteringEngine {
    pub fn new(config: ClusteringConfig) -> CanopyResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    fn uses_streaming(&self, n: usize) -> bool {
        self.config.algorithm == "kmeans" || n > self.config.large_scale_threshold
    }

    /// Reduction, mixture fit and soft assignment over the full level
    fn cluster_dense(
        &self,
        embeddings: &[Vec<f32>],
        dim: usize,
        level: u32,
    ) -> CanopyResult<Vec<Cluster>> {
        let n = embeddings.len();
        let data = to_matrix(embeddings, dim);

        let n_neighbors = self
            .config
            .n_neighbors
            .unwrap_or_else(|| ((n - 1) as f64).sqrt().floor() as usize);
        let target_dim = self.config.reduction_dim.min(n.saturating_sub(2)).max(1);
        let reduced = ManifoldReducer::new(
            n_neighbors,
            target_dim,
            self.config.min_dist,
            self.config.reduction_epochs,
            self.config.random_seed,
        )
        .fit_transform(&data)?;

        let gmm = Gmm::new()
            .with_max_iter(self.config.max_iter)
            .with_tol(self.config.tol)
            .with_seed(self.config.random_seed);
        let model = match self.config.n_components {
            Some(k) => gmm.with_n_components(k.min(n)).fit(&reduced)?,
            None => select_by_bic(&gmm, &reduced, self.config.max_clusters.min(n - 1))?,
        };
        debug!(
            level,
            components = model.n_components(),
            converged = model.converged(),
            "Selected mixture model"
        );

        let groups = soft_assign(&model.predict_proba(&reduced), self.config.threshold);
        Ok(into_clusters(groups, level, embeddings, dim))
    }

    /// Batch-fed PCA and mini-batch k-means; labels by streaming prediction
    fn cluster_streaming(
        &self,
        embeddings: &[Vec<f32>],
        dim: usize,
        level: u32,
    ) -> CanopyResult<Vec<Cluster>> {
        let n = embeddings.len();
        let batch_size = self.config.batch_size;

        let mut pca = IncrementalPca::new(dim, self.config.reduction_dim, self.config.random_seed);
        for batch in embeddings.chunks(batch_size) {
            pca.partial_fit(&to_matrix(batch, dim));
        }
        let pca = pca.finish()?;

        let k = self
            .config
            .n_components
            .unwrap_or(self.config.max_clusters)
            .clamp(1, n);
        // Seed from rows spread evenly over the input, not just the first batch
        let sample_len = batch_size.max(k).min(n);
        let stride = (n / sample_len).max(1);
        let sample_rows: Vec<Vec<f32>> = embeddings
            .iter()
            .step_by(stride)
            .take(sample_len)
            .cloned()
            .collect();
        let sample = pca.transform(&to_matrix(&sample_rows, dim));
        let mut rng = StdRng::seed_from_u64(self.config.random_seed);
        let mut kmeans = MiniBatchKMeans::init(&sample, k, &mut rng)?;
        drop(sample);
        drop(sample_rows);

        for epoch in 0..self.config.kmeans_epochs {
            for batch in embeddings.chunks(batch_size) {
                kmeans.partial_fit(&pca.transform(&to_matrix(batch, dim)));
            }
            debug!(level, epoch, "Mini-batch k-means epoch complete");
        }

        let mut groups = vec![Vec::new(); k];
        for (b, batch) in embeddings.chunks(batch_size).enumerate() {
            let offset = b * batch_size;
            let labels = kmeans.predict(&pca.transform(&to_matrix(batch, dim)));
            for (i, label) in labels.into_iter().enumerate() {
                groups[label].push(offset + i);
            }
        }
        Ok(into_clusters(groups, level, embeddings, dim))
    }
}

impl Clusterer for ClusteringEngine {
    fn cluster(&self, embeddings: &[Vec<f32>], level: u32) -> CanopyResult<Vec<Cluster>> {
        self.config.validate()?;
        let dim = validate_embeddings(embeddings)?;
        let n = embeddings.len();

        if n == 0 {
            return Ok(Vec::new());
        }
        if n <= self.config.small_input_floor.max(1) {
            debug!(level, points = n, "Input below clustering floor, single cluster");
            return Ok(vec![single_cluster(embeddings, dim, level)]);
        }
        if embeddings[1..].iter().all(|vector| vector == &embeddings[0]) {
            debug!(level, points = n, "Identical embeddings, single cluster");
            return Ok(vec![single_cluster(embeddings, dim, level)]);
        }

        let started = Instant::now();
        let streaming = self.uses_streaming(n);
        let clusters = if streaming {
            self.cluster_streaming(embeddings, dim, level)?
        } else {
            self.cluster_dense(embeddings, dim, level)?
        };
        info!(
            level,
            points = n,
            clusters = clusters.len(),
            streaming,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Clustered embeddings"
        );
        Ok(clusters)
    }
}

/// Members of every component
///
/// A point joins each component whose probability exceeds `threshold`; a
/// point clearing no threshold joins its most probable component.
pub fn soft_assign(proba: &Array2<f64>, threshold: f64) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); proba.ncols()];
    for (i, row) in proba.rows().into_iter().enumerate() {
        let mut placed = false;
        for (c, p) in row.iter().enumerate() {
            if *p > threshold {
                groups[c].push(i);
                placed = true;
            }
        }
        if !placed {
            let best = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(c, _)| c);
            if let Some(c) = best {
                groups[c].push(i);
            }
        }
    }
    groups
}

fn single_cluster(embeddings: &[Vec<f32>], dim: usize, level: u32) -> Cluster {
    let mut cluster = Cluster::new(0, level, (0..embeddings.len()).collect());
    cluster.centroid = Some(centroid_of(embeddings, &cluster.node_indices, dim));
    cluster
}

/// Drop empty groups and number the rest densely
fn into_clusters(
    groups: Vec<Vec<usize>>,
    level: u32,
    embeddings: &[Vec<f32>],
    dim: usize,
) -> Vec<Cluster> {
    groups
        .into_iter()
        .filter(|members| !members.is_empty())
        .enumerate()
        .map(|(id, members)| {
            let centroid = centroid_of(embeddings, &members, dim);
            let mut cluster = Cluster::new(id, level, members);
            cluster.centroid = Some(centroid);
            cluster
        })
        .collect()
}
