//! Input validation and dense matrix helpers

use canopy_core::{CanopyError, CanopyResult};
use ndarray::{Array1, Array2, ArrayView1};

/// Check that every vector is non-empty, finite, and of one dimensionality
///
/// Returns the shared dimension, or 0 for an empty input.
pub fn validate_embeddings(embeddings: &[Vec<f32>]) -> CanopyResult<usize> {
    let Some(first) = embeddings.first() else {
        return Ok(0);
    };
    let dim = first.len();
    if dim == 0 {
        return Err(CanopyError::validation("embedding 0 is empty"));
    }

    for (i, vector) in embeddings.iter().enumerate() {
        if vector.len() != dim {
            return Err(CanopyError::validation(format!(
                "embedding {i} has dimension {}, expected {dim}",
                vector.len()
            )));
        }
        if let Some(position) = vector.iter().position(|v| !v.is_finite()) {
            return Err(CanopyError::validation(format!(
                "embedding {i} has a non-finite value at position {position}"
            )));
        }
    }
    Ok(dim)
}

/// Copy validated rows into an `n x d` matrix
pub fn to_matrix(rows: &[Vec<f32>], dim: usize) -> Array2<f64> {
    let mut matrix = Array2::zeros((rows.len(), dim));
    for (i, row) in rows.iter().enumerate() {
        for (j, value) in row.iter().enumerate() {
            matrix[[i, j]] = f64::from(*value);
        }
    }
    matrix
}

pub fn squared_distance(a: &ArrayView1<'_, f64>, b: &ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Index of the row in `centroids` closest to `point`
pub fn nearest(point: &ArrayView1<'_, f64>, centroids: &Array2<f64>) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let dist = squared_distance(point, &centroid);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

/// Mean of the original embeddings at `members`
pub fn centroid_of(embeddings: &[Vec<f32>], members: &[usize], dim: usize) -> Vec<f32> {
    let mut sum = Array1::<f64>::zeros(dim);
    for &i in members {
        for (j, value) in embeddings[i].iter().enumerate() {
            sum[j] += f64::from(*value);
        }
    }
    let count = members.len().max(1) as f64;
    sum.iter().map(|v| (v / count) as f32).collect()
}
