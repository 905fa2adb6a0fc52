//! Core of Canopy: recursive cluster-and-summarize document trees
//!
//! This crate owns the domain model and the abstractions every other crate
//! builds on:
//!
//! - **Types**: [`Chunk`], [`SummaryNode`], [`NodeId`], [`Cluster`], [`DocumentTree`]
//! - **Collaborators**: [`Chunker`], [`Embedder`], [`Summarizer`], [`Clusterer`]
//! - **Storage**: the [`NodeStore`] trait (SQLite backend in `canopy-sqlite`)
//! - **Tree building**: [`TreeBuilder`] runs the level loop until one root remains
//! - **Interaction**: [`InteractiveEngine`] navigates and refines a persisted tree
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canopy_core::{CanopyConfig, TreeBuilder};
//! use std::sync::Arc;
//!
//! let config = CanopyConfig::load("canopy.toml")?;
//! let builder = TreeBuilder::new(
//!     config.builder.clone(),
//!     chunker,
//!     embedder,
//!     summarizer,
//!     Arc::new(canopy_cluster::ClusteringEngine::new(config.clustering.clone())?),
//!     store,
//! );
//! let tree = builder.build(&document_text).await?;
//! println!("root at level {}", tree.depth());
//! ```

pub mod batch;
pub mod builder;
pub mod config;
pub mod error;
pub mod interactive;
pub mod sanitize;
pub mod store;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use batch::{batched, batched_stream, Batched};
pub use builder::TreeBuilder;
pub use config::{BuilderConfig, CanopyConfig, ClusteringConfig, InteractiveConfig, StoreConfig};
pub use error::{CanopyError, CanopyResult};
pub use interactive::InteractiveEngine;
pub use store::{check_id, NodeStore, StoreError, StoreResult};
pub use traits::{Chunker, Clusterer, Embedder, SummarizeOptions, Summarizer};
pub use types::{
    Chunk, Cluster, DikwLevel, DocumentTree, Node, NodeId, RefinementRecord, SummaryMetadata,
    SummaryNode, TreeMetadata,
};
