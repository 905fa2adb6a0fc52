//! Persistent node store abstraction
//!
//! The store keeps one record per node keyed by its storage key, with the
//! node content and its embedding held separately so that embedding-only
//! updates never rewrite content and bulk content reads never pay for vector
//! payloads. Backends (see `canopy-sqlite`) implement [`NodeStore`].
//!
//! ## Streaming contract
//!
//! Methods returning a [`BoxStream`] are lazy and single-pass: pages are
//! fetched as the stream is polled, and a level's ids are never materialized
//! as one list by the store.

pub mod error;

pub use error::{check_id, StoreError, StoreResult};

use crate::types::{Chunk, Node, NodeId, SummaryNode};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Storage for chunks and summary nodes
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Upsert chunks by index, in bounded transactions; returns the number written
    async fn add_chunks(&self, chunks: BoxStream<'_, Chunk>) -> StoreResult<usize>;

    /// Upsert summary nodes by id, in bounded transactions; returns the number written
    async fn add_summaries(&self, nodes: BoxStream<'_, SummaryNode>) -> StoreResult<usize>;

    /// Fetch one node; `None` if absent
    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<Node>>;

    /// Fetch many nodes with batched lookups, in request order; absent ids are skipped
    fn get_nodes(&self, ids: Vec<NodeId>) -> BoxStream<'_, StoreResult<Node>>;

    /// Atomically replace an existing node; returns `false` (and writes nothing) if absent
    async fn update_node(&self, node: &Node) -> StoreResult<bool>;

    /// Replace the embeddings of existing nodes in one transaction; returns the number updated
    async fn set_embeddings(&self, embeddings: Vec<(NodeId, Vec<f32>)>) -> StoreResult<usize>;

    /// Stream the ids stored at `level` in enumeration order
    fn node_ids_by_level(&self, level: u32) -> BoxStream<'_, StoreResult<NodeId>>;

    /// Stream `(id, embedding)` pairs at `level` in enumeration order
    fn level_embeddings(&self, level: u32)
        -> BoxStream<'_, StoreResult<(NodeId, Option<Vec<f32>>)>>;

    /// Highest stored level, 0 for an empty store
    async fn max_level(&self) -> StoreResult<u32>;

    /// Number of nodes stored at `level`
    async fn node_count(&self, level: u32) -> StoreResult<usize>;
}
