//! Collaborator traits
//!
//! The core only defines these abstractions; chunking, embedding and text
//! generation live outside this workspace and are injected through
//! constructors as `Arc<dyn Trait>`.

use crate::error::CanopyResult;
use crate::types::{Chunk, Cluster};
use async_trait::async_trait;

/// Splits raw text into ordered, non-overlapping chunks
///
/// Implementations return indices `0..N` with increasing offsets. The
/// returned iterator is consumed once.
pub trait Chunker: Send + Sync {
    fn split<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = CanopyResult<Chunk>> + Send + 'a>;
}

/// Computes embedding vectors
///
/// Both methods must preserve order and return exactly one output per input,
/// with a stable dimensionality for the lifetime of a build.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Attach embeddings to a batch of chunks
    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> anyhow::Result<Vec<Chunk>>;

    /// Embed arbitrary strings
    async fn embed_strings(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Options for one summarization call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummarizeOptions {
    /// Named prompt strategy understood by the summarizer
    pub strategy: Option<String>,
    /// User instruction for a refinement, already sanitized
    pub instruction: Option<String>,
    pub max_tokens: Option<usize>,
}

/// Produces summary text; not assumed deterministic
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, options: &SummarizeOptions) -> anyhow::Result<String>;
}

/// Partitions one level's embeddings into clusters
///
/// Cluster `node_indices` are positions in `embeddings`.
pub trait Clusterer: Send + Sync {
    fn cluster(&self, embeddings: &[Vec<f32>], level: u32) -> CanopyResult<Vec<Cluster>>;
}
