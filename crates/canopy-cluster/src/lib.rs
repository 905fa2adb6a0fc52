//! Clustering engine for Canopy
//!
//! [`ClusteringEngine`] implements [`canopy_core::Clusterer`]. Dense levels
//! are projected with a neighbor-graph reduction and grouped by a Gaussian
//! mixture whose size is picked by BIC; membership is soft. Large levels go
//! through incremental PCA and mini-batch k-means in fixed-size batches.
//!
//! ```rust,ignore
//! use canopy_cluster::ClusteringEngine;
//! use canopy_core::{Clusterer, ClusteringConfig};
//!
//! let engine = ClusteringEngine::new(ClusteringConfig::default())?;
//! let clusters = engine.cluster(&embeddings, 0)?;
//! ```

pub mod engine;
pub mod gmm;
pub mod kmeans;
pub mod matrix;
pub mod pca;
pub mod reduce;

pub use engine::{soft_assign, ClusteringEngine};
pub use gmm::{select_by_bic, Gmm, GmmModel};
pub use kmeans::MiniBatchKMeans;
pub use pca::{IncrementalPca, PcaModel};
pub use reduce::ManifoldReducer;
