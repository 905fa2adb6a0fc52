//! Recursive tree builder
//!
//! Builds a RAPTOR tree level by level:
//!
//! 1. **Ingest**: chunk the text, embed the chunks, persist them in batches
//! 2. **Cluster**: group the current level's embeddings
//! 3. **Summarize**: one summary node per cluster, persisted and embedded in batches
//! 4. **Repeat** on the new level until a single root remains
//!
//! Only one level's embeddings are resident at a time; everything else flows
//! through fixed-size batches.

use crate::batch::batched;
use crate::config::BuilderConfig;
use crate::error::{CanopyError, CanopyResult};
use crate::store::NodeStore;
use crate::traits::{Chunker, Clusterer, Embedder, SummarizeOptions, Summarizer};
use crate::types::{Chunk, Cluster, DocumentTree, Node, NodeId, SummaryNode, TreeMetadata};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Separator placed between children's text
pub const CHILD_SEPARATOR: &str = "\n\n";

/// Orchestrates chunking, clustering, summarization and persistence
pub struct TreeBuilder {
    config: BuilderConfig,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    clusterer: Arc<dyn Clusterer>,
    store: Arc<dyn NodeStore>,
}

impl TreeBuilder {
    pub fn new(
        config: BuilderConfig,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
        clusterer: Arc<dyn Clusterer>,
        store: Arc<dyn NodeStore>,
    ) -> Self {
        Self {
            config,
            chunker,
            embedder,
            summarizer,
            clusterer,
            store,
        }
    }

    /// Chunk `text` and build its tree
    pub async fn build(&self, text: &str) -> CanopyResult<DocumentTree> {
        let chunks = self.chunker.split(text);
        self.build_from_chunks(chunks).await
    }

    /// Build a tree from an already chunked document
    ///
    /// The chunk sequence is consumed once.
    pub async fn build_from_chunks<I>(&self, chunks: I) -> CanopyResult<DocumentTree>
    where
        I: IntoIterator<Item = CanopyResult<Chunk>>,
        I::IntoIter: Send,
    {
        self.config.validate()?;
        let started = Instant::now();

        let leaf_chunk_ids = self.ingest_chunks(chunks).await?;
        info!(chunks = leaf_chunk_ids.len(), "Ingested chunk level");

        let mut summaries = self.config.collect_summaries.then(HashMap::new);
        let mut summary_count = 0usize;
        let mut level = 0u32;
        let mut current: Vec<NodeId> = leaf_chunk_ids.iter().copied().map(NodeId::Chunk).collect();

        while current.len() > 1 {
            let (ids, embeddings) = self.load_level(level, &current).await?;
            let count = ids.len();

            let clusters = if self.is_last_allowed_level(level + 1) {
                info!(level, count, "Reached maximum depth, merging level into the root");
                vec![Cluster::new(0, level, (0..count).collect())]
            } else {
                self.clusterer.cluster(&embeddings, level)?
            };
            drop(embeddings);

            let clusters = ensure_progress(clusters, count, level)?;
            info!(level, nodes = count, clusters = clusters.len(), "Clustered level");

            let created = self
                .summarize_level(&ids, clusters, level + 1, &mut summaries)
                .await?;
            summary_count += created.len();
            level += 1;
            current = created;
        }

        let root_id = match current.pop() {
            Some(id) => id,
            None => {
                return Err(CanopyError::invariant(format!(
                    "no nodes remain at level {level}"
                )))
            }
        };

        let root_node = match root_id {
            NodeId::Chunk(index) => {
                let node = self.wrap_single_chunk(index).await?;
                summary_count += 1;
                node
            }
            NodeId::Summary(_) => match self.store.get_node(&root_id).await? {
                Some(Node::Summary(node)) => node,
                Some(Node::Chunk(_)) => {
                    return Err(CanopyError::invariant(format!(
                        "root {root_id} resolved to a chunk"
                    )))
                }
                None => {
                    return Err(CanopyError::invariant(format!(
                        "root {root_id} is missing from the store"
                    )))
                }
            },
        };

        if let Some(map) = summaries.as_mut() {
            map.insert(root_node.id.clone(), without_embedding(root_node.clone()));
        }

        let metadata = TreeMetadata {
            level_count: root_node.level + 1,
            chunk_count: leaf_chunk_ids.len(),
            summary_count,
        };
        info!(
            root = %root_node.id,
            levels = metadata.level_count,
            summaries = summary_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tree build complete"
        );

        Ok(DocumentTree {
            root_node,
            leaf_chunk_ids,
            summaries,
            metadata,
        })
    }

    fn is_last_allowed_level(&self, next_level: u32) -> bool {
        self.config.max_levels.is_some_and(|max| next_level >= max)
    }

    /// Level 0: validate, embed and persist chunks batch by batch
    async fn ingest_chunks<I>(&self, chunks: I) -> CanopyResult<Vec<u64>>
    where
        I: IntoIterator<Item = CanopyResult<Chunk>>,
        I::IntoIter: Send,
    {
        let mut chunks = chunks.into_iter().peekable();
        if chunks.peek().is_none() {
            return Err(CanopyError::EmptyInput);
        }

        let mut leaf_ids = Vec::new();
        let mut seen = HashSet::new();

        for batch in batched(chunks, self.config.write_batch_size) {
            let batch: Vec<Chunk> = batch.into_iter().collect::<CanopyResult<_>>()?;
            for chunk in &batch {
                chunk.validate()?;
                if !seen.insert(chunk.index) {
                    return Err(CanopyError::validation(format!(
                        "duplicate chunk index {}",
                        chunk.index
                    )));
                }
            }

            let expected = batch.len();
            let embedded = self.embedder.embed_chunks(batch).await?;
            ensure_one_to_one("embed_chunks", expected, embedded.len())?;
            for chunk in &embedded {
                if chunk.embedding.is_none() {
                    return Err(CanopyError::validation(format!(
                        "embedder returned chunk {} without an embedding",
                        chunk.index
                    )));
                }
                chunk.validate()?;
            }

            leaf_ids.extend(embedded.iter().map(|chunk| chunk.index));
            let written = self.store.add_chunks(stream::iter(embedded).boxed()).await?;
            debug!(written, total = leaf_ids.len(), "Persisted chunk batch");
        }

        Ok(leaf_ids)
    }

    /// Stream one level's embeddings in store order, restricted to this run's nodes
    async fn load_level(
        &self,
        level: u32,
        members: &[NodeId],
    ) -> CanopyResult<(Vec<NodeId>, Vec<Vec<f32>>)> {
        let wanted: HashSet<&NodeId> = members.iter().collect();
        let mut ids = Vec::with_capacity(members.len());
        let mut embeddings = Vec::with_capacity(members.len());

        let mut pairs = self.store.level_embeddings(level);
        while let Some((id, embedding)) = pairs.try_next().await? {
            if !wanted.contains(&id) {
                continue;
            }
            let vector = embedding.ok_or_else(|| {
                CanopyError::validation(format!("{id} has no embedding at level {level}"))
            })?;
            ids.push(id);
            embeddings.push(vector);
        }

        if ids.len() != members.len() {
            return Err(CanopyError::invariant(format!(
                "level {level} holds {} of {} expected nodes",
                ids.len(),
                members.len()
            )));
        }
        Ok((ids, embeddings))
    }

    /// Create, persist and embed one summary node per cluster
    async fn summarize_level(
        &self,
        level_ids: &[NodeId],
        clusters: Vec<Cluster>,
        new_level: u32,
        summaries: &mut Option<HashMap<String, SummaryNode>>,
    ) -> CanopyResult<Vec<NodeId>> {
        let options = SummarizeOptions {
            strategy: Some(self.config.summary_strategy.clone()),
            instruction: None,
            max_tokens: self.config.summary_max_tokens,
        };
        let mut created = Vec::with_capacity(clusters.len());

        for batch in batched(clusters, self.config.write_batch_size) {
            let mut nodes = Vec::with_capacity(batch.len());
            for cluster in batch {
                let children: Vec<NodeId> = cluster
                    .node_indices
                    .iter()
                    .map(|&position| level_ids[position].clone())
                    .collect();
                let text = self.gather_text(&children).await?;
                let summary = self.summarizer.summarize(&text, &options).await?;
                if summary.trim().is_empty() {
                    return Err(CanopyError::validation(format!(
                        "summarizer returned blank text for cluster {} at level {}",
                        cluster.id, cluster.level
                    )));
                }
                nodes.push(SummaryNode::new(summary, new_level, children, Some(cluster.id)));
            }

            self.store
                .add_summaries(stream::iter(nodes.clone()).boxed())
                .await?;
            self.embed_summaries(&mut nodes).await?;
            debug!(level = new_level, batch = nodes.len(), "Persisted summary batch");

            created.extend(nodes.iter().map(SummaryNode::node_id));
            if let Some(map) = summaries.as_mut() {
                map.extend(
                    nodes
                        .into_iter()
                        .map(|node| (node.id.clone(), without_embedding(node))),
                );
            }
        }

        Ok(created)
    }

    /// Embed freshly persisted summaries and store the vectors
    async fn embed_summaries(&self, nodes: &mut [SummaryNode]) -> CanopyResult<()> {
        let texts: Vec<String> = nodes.iter().map(|node| node.text.clone()).collect();
        let vectors = self.embedder.embed_strings(texts).await?;
        ensure_one_to_one("embed_strings", nodes.len(), vectors.len())?;

        let mut pairs = Vec::with_capacity(nodes.len());
        for (node, vector) in nodes.iter_mut().zip(vectors) {
            if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
                return Err(CanopyError::validation(format!(
                    "embedder returned an invalid vector for summary {}",
                    node.id
                )));
            }
            node.embedding = Some(vector.clone());
            pairs.push((node.node_id(), vector));
        }
        self.store.set_embeddings(pairs).await?;
        Ok(())
    }

    /// Concatenate children's text in declared order
    async fn gather_text(&self, children: &[NodeId]) -> CanopyResult<String> {
        let nodes: Vec<Node> = self
            .store
            .get_nodes(children.to_vec())
            .try_collect()
            .await?;
        if nodes.len() != children.len() {
            return Err(CanopyError::invariant(format!(
                "{} of {} children could not be loaded",
                children.len() - nodes.len(),
                children.len()
            )));
        }
        Ok(nodes
            .iter()
            .map(Node::text)
            .collect::<Vec<_>>()
            .join(CHILD_SEPARATOR))
    }

    /// A single-chunk document gets a level-1 root wrapping that chunk
    async fn wrap_single_chunk(&self, index: u64) -> CanopyResult<SummaryNode> {
        let id = NodeId::Chunk(index);
        let chunk = match self.store.get_node(&id).await? {
            Some(Node::Chunk(chunk)) => chunk,
            _ => {
                return Err(CanopyError::invariant(format!(
                    "sole surviving {id} is missing from the store"
                )))
            }
        };

        info!(chunk = index, "Single-chunk document, synthesizing root");
        let mut nodes = vec![SummaryNode::new(chunk.text, 1, vec![id], None)];
        self.store
            .add_summaries(stream::iter(nodes.clone()).boxed())
            .await?;
        self.embed_summaries(&mut nodes).await?;
        nodes
            .pop()
            .ok_or_else(|| CanopyError::invariant("synthesized root vanished"))
    }
}

/// Collected summaries carry text and links only; vectors stay in the store
fn without_embedding(node: SummaryNode) -> SummaryNode {
    SummaryNode {
        embedding: None,
        ..node
    }
}

fn ensure_one_to_one(operation: &str, expected: usize, actual: usize) -> CanopyResult<()> {
    if expected != actual {
        return Err(CanopyError::validation(format!(
            "{operation} returned {actual} results for {expected} inputs"
        )));
    }
    Ok(())
}

/// Drop empty clusters, check bounds, and force a merge when nothing was reduced
fn ensure_progress(clusters: Vec<Cluster>, count: usize, level: u32) -> CanopyResult<Vec<Cluster>> {
    let clusters: Vec<Cluster> = clusters.into_iter().filter(|c| !c.is_empty()).collect();
    if let Some(bad) = clusters
        .iter()
        .flat_map(|c| c.node_indices.iter())
        .find(|&&position| position >= count)
    {
        return Err(CanopyError::invariant(format!(
            "cluster index {bad} out of range for level {level} with {count} nodes"
        )));
    }

    if clusters.is_empty() || clusters.len() >= count {
        warn!(
            level,
            nodes = count,
            clusters = clusters.len(),
            "Clustering achieved no reduction, merging the whole level into one cluster"
        );
        return Ok(vec![Cluster::new(0, level, (0..count).collect())]);
    }
    Ok(clusters)
}
