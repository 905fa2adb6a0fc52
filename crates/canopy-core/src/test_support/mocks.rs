//! Mock Implementations for Testing
//!
//! - **Deterministic**: same input, same output
//! - **Observable**: calls are tracked for assertions
//! - **Configurable**: failures can be injected where tests need them

use crate::error::{CanopyError, CanopyResult};
use crate::store::{check_id, NodeStore, StoreResult};
use crate::traits::{Chunker, Clusterer, Embedder, SummarizeOptions, Summarizer};
use crate::types::{Chunk, Cluster, Node, NodeId, SummaryNode};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Splits text on blank lines; each non-blank paragraph becomes one chunk
#[derive(Debug, Default, Clone)]
pub struct ParagraphChunker;

impl Chunker for ParagraphChunker {
    fn split<'a>(
        &'a self,
        text: &'a str,
    ) -> Box<dyn Iterator<Item = CanopyResult<Chunk>> + Send + 'a> {
        let mut offset = 0usize;
        let paragraphs = text.split("\n\n").filter_map(move |raw| {
            let start = offset;
            let len = raw.chars().count();
            offset += len + 2;
            if raw.trim().is_empty() {
                None
            } else {
                Some((raw.to_string(), start, start + len))
            }
        });
        Box::new(
            paragraphs
                .enumerate()
                .map(|(index, (text, start, end))| Ok(Chunk::new(index as u64, text, start, end))),
        )
    }
}

/// Embeds text by hashing its bytes into a fixed number of buckets
pub struct HashEmbedder {
    dimensions: usize,
    chunk_calls: AtomicUsize,
    string_calls: AtomicUsize,
    fail: AtomicBool,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            chunk_calls: AtomicUsize::new(0),
            string_calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every following call fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn string_calls(&self) -> usize {
        self.string_calls.load(Ordering::SeqCst)
    }

    /// Deterministic vector for `text`
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            let bucket = (byte as usize + i * 31) % self.dimensions;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        } else {
            vector[0] = 1.0;
        }
        vector
    }

    fn check_failure(&self) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("mock embedder failure");
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> anyhow::Result<Vec<Chunk>> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(chunks
            .into_iter()
            .map(|chunk| {
                let vector = self.vector_for(&chunk.text);
                chunk.with_embedding(vector)
            })
            .collect())
    }

    async fn embed_strings(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        self.string_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(texts.iter().map(|text| self.vector_for(text)).collect())
    }
}

/// Record of one summarizer call
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizerCall {
    pub text: String,
    pub options: SummarizeOptions,
}

/// Summarizer returning a deterministic digest of its input
pub struct EchoSummarizer {
    calls: Mutex<Vec<SummarizerCall>>,
    fail: AtomicBool,
}

impl EchoSummarizer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SummarizerCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for EchoSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, text: &str, options: &SummarizeOptions) -> anyhow::Result<String> {
        self.calls.lock().push(SummarizerCall {
            text: text.to_string(),
            options: options.clone(),
        });
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("mock summarizer failure");
        }
        let head: String = text.chars().take(80).collect();
        Ok(match &options.instruction {
            Some(instruction) => format!("Refined ({instruction}): {head}"),
            None => format!("Summary: {head}"),
        })
    }
}

/// Groups consecutive positions in pairs: `[0, 1], [2, 3], ...`
#[derive(Debug, Default, Clone)]
pub struct PairwiseClusterer;

impl Clusterer for PairwiseClusterer {
    fn cluster(&self, embeddings: &[Vec<f32>], level: u32) -> CanopyResult<Vec<Cluster>> {
        if embeddings.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CanopyError::validation("non-finite embedding value"));
        }
        Ok((0..embeddings.len())
            .collect::<Vec<_>>()
            .chunks(2)
            .enumerate()
            .map(|(id, pair)| Cluster::new(id, level, pair.to_vec()))
            .collect())
    }
}

#[derive(Default)]
struct MemoryState {
    order: Vec<String>,
    nodes: HashMap<String, Node>,
}

impl MemoryState {
    fn upsert(&mut self, node: Node) {
        let key = node.id().storage_key();
        if !self.nodes.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.nodes.insert(key, node);
    }
}

/// In-memory [`NodeStore`] keeping insertion order
#[derive(Default)]
pub struct MemoryNodeStore {
    state: Mutex<MemoryState>,
    get_nodes_calls: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_nodes` calls so far
    pub fn get_nodes_calls(&self) -> usize {
        self.get_nodes_calls.load(Ordering::SeqCst)
    }

    /// Number of write operations (batches, updates) so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn level_nodes(&self, level: u32) -> Vec<Node> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|key| state.nodes.get(key))
            .filter(|node| node.level() == level)
            .cloned()
            .collect()
    }
}

fn check_ids<'a>(ids: impl IntoIterator<Item = &'a NodeId>) -> StoreResult<()> {
    for id in ids {
        check_id(id)?;
    }
    Ok(())
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn add_chunks(&self, chunks: BoxStream<'_, Chunk>) -> StoreResult<usize> {
        let chunks: Vec<Chunk> = chunks.collect().await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let count = chunks.len();
        for chunk in chunks {
            state.upsert(Node::Chunk(chunk));
        }
        Ok(count)
    }

    async fn add_summaries(&self, nodes: BoxStream<'_, SummaryNode>) -> StoreResult<usize> {
        let nodes: Vec<SummaryNode> = nodes.collect().await;
        for node in &nodes {
            check_id(&node.node_id())?;
            node.validate()?;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let count = nodes.len();
        for node in nodes {
            state.upsert(Node::Summary(node));
        }
        Ok(count)
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<Node>> {
        check_id(id)?;
        Ok(self.state.lock().nodes.get(&id.storage_key()).cloned())
    }

    fn get_nodes(&self, ids: Vec<NodeId>) -> BoxStream<'_, StoreResult<Node>> {
        self.get_nodes_calls.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = check_ids(&ids) {
            return stream::once(async move { Err(e) }).boxed();
        }
        let state = self.state.lock();
        let found: Vec<StoreResult<Node>> = ids
            .iter()
            .filter_map(|id| state.nodes.get(&id.storage_key()).cloned())
            .map(Ok)
            .collect();
        stream::iter(found).boxed()
    }

    async fn update_node(&self, node: &Node) -> StoreResult<bool> {
        let id = node.id();
        check_id(&id)?;
        let mut state = self.state.lock();
        let key = id.storage_key();
        if !state.nodes.contains_key(&key) {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        state.nodes.insert(key, node.clone());
        Ok(true)
    }

    async fn set_embeddings(&self, embeddings: Vec<(NodeId, Vec<f32>)>) -> StoreResult<usize> {
        check_ids(embeddings.iter().map(|(id, _)| id))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let mut updated = 0;
        for (id, vector) in embeddings {
            match state.nodes.get_mut(&id.storage_key()) {
                Some(Node::Chunk(chunk)) => chunk.embedding = Some(vector),
                Some(Node::Summary(node)) => node.embedding = Some(vector),
                None => continue,
            }
            updated += 1;
        }
        Ok(updated)
    }

    fn node_ids_by_level(&self, level: u32) -> BoxStream<'_, StoreResult<NodeId>> {
        let ids: Vec<StoreResult<NodeId>> =
            self.level_nodes(level).iter().map(|node| Ok(node.id())).collect();
        stream::iter(ids).boxed()
    }

    fn level_embeddings(
        &self,
        level: u32,
    ) -> BoxStream<'_, StoreResult<(NodeId, Option<Vec<f32>>)>> {
        let pairs: Vec<StoreResult<(NodeId, Option<Vec<f32>>)>> = self
            .level_nodes(level)
            .into_iter()
            .map(|node| Ok((node.id(), node.embedding().map(<[f32]>::to_vec))))
            .collect();
        stream::iter(pairs).boxed()
    }

    async fn max_level(&self) -> StoreResult<u32> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .map(Node::level)
            .max()
            .unwrap_or(0))
    }

    async fn node_count(&self, level: u32) -> StoreResult<usize> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|node| node.level() == level)
            .count())
    }
}

