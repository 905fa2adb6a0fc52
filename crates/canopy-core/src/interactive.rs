//! Navigation and refinement over a persisted tree

use crate::builder::CHILD_SEPARATOR;
use crate::config::InteractiveConfig;
use crate::error::{CanopyError, CanopyResult};
use crate::sanitize::sanitize_instruction;
use crate::store::NodeStore;
use crate::traits::{SummarizeOptions, Summarizer};
use crate::types::{Chunk, Node, NodeId, RefinementRecord, SummaryNode};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Strategy name sent with refinement calls
pub const REFINE_STRATEGY: &str = "refine";

/// Read and edit access to a built tree
pub struct InteractiveEngine {
    config: InteractiveConfig,
    store: Arc<dyn NodeStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

/// Breadth-first descent state for [`InteractiveEngine::get_source_chunks`]
struct Descent {
    start: Option<NodeId>,
    frontier: Vec<NodeId>,
    pending: VecDeque<Chunk>,
    visited: HashSet<NodeId>,
    yielded: HashSet<u64>,
    remaining: Option<usize>,
}

impl InteractiveEngine {
    pub fn new(
        config: InteractiveConfig,
        store: Arc<dyn NodeStore>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        Self {
            config,
            store,
            summarizer,
        }
    }

    /// Immediate children of `node`, fetched in one batched lookup
    pub fn get_children(&self, node: &Node) -> BoxStream<'_, CanopyResult<Node>> {
        let children = node.children().to_vec();
        if children.is_empty() {
            return stream::empty().boxed();
        }
        self.store
            .get_nodes(children)
            .map_err(CanopyError::from)
            .boxed()
    }

    /// Level-0 chunks under `node_id`, breadth first, at most `limit` of them
    ///
    /// Each layer is fetched with one batched lookup; summary nodes reached
    /// twice are expanded once and chunks are yielded once.
    pub fn get_source_chunks(
        &self,
        node_id: &NodeId,
        limit: Option<usize>,
    ) -> BoxStream<'_, CanopyResult<Chunk>> {
        let state = Descent {
            start: Some(node_id.clone()),
            frontier: Vec::new(),
            pending: VecDeque::new(),
            visited: HashSet::new(),
            yielded: HashSet::new(),
            remaining: limit,
        };

        stream::try_unfold(state, move |state| self.next_source_chunk(state)).boxed()
    }

    async fn next_source_chunk(
        &self,
        mut state: Descent,
    ) -> CanopyResult<Option<(Chunk, Descent)>> {
        loop {
            if state.remaining == Some(0) {
                debug!("Source chunk limit reached, stopping descent");
                return Ok(None);
            }
            if let Some(chunk) = state.pending.pop_front() {
                if let Some(remaining) = state.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Ok(Some((chunk, state)));
            }
            if let Some(start) = state.start.take() {
                start.validate()?;
                match self.store.get_node(&start).await? {
                    Some(node) => self.visit(&mut state, node),
                    None => return Err(CanopyError::NotFound(start)),
                }
                continue;
            }
            if state.frontier.is_empty() {
                return Ok(None);
            }
            self.expand_layer(&mut state).await?;
        }
    }

    fn visit(&self, state: &mut Descent, node: Node) {
        match node {
            Node::Chunk(chunk) => {
                if state.yielded.insert(chunk.index) {
                    state.pending.push_back(chunk);
                }
            }
            Node::Summary(summary) => {
                if !state.visited.insert(summary.node_id()) {
                    return;
                }
                for child in summary.children_indices {
                    let already = match &child {
                        NodeId::Chunk(index) => state.yielded.contains(index),
                        NodeId::Summary(_) => state.visited.contains(&child),
                    };
                    if !already {
                        state.frontier.push(child);
                    }
                }
            }
        }
    }

    async fn expand_layer(&self, state: &mut Descent) -> CanopyResult<()> {
        let mut layer = std::mem::take(&mut state.frontier);
        let mut seen = HashSet::with_capacity(layer.len());
        layer.retain(|id| seen.insert(id.clone()));
        if layer.len() > self.config.max_frontier {
            warn!(
                frontier = layer.len(),
                max = self.config.max_frontier,
                "Source chunk frontier too large, truncating"
            );
            layer.truncate(self.config.max_frontier);
        }

        let nodes: Vec<Node> = self.store.get_nodes(layer).try_collect().await?;
        for node in nodes {
            self.visit(state, node);
        }
        Ok(())
    }

    /// The single summary node at the highest level, `None` for an empty tree
    pub async fn get_root_node(&self) -> CanopyResult<Option<SummaryNode>> {
        let max_level = self.store.max_level().await?;
        if max_level == 0 {
            return Ok(None);
        }

        let ids: Vec<NodeId> = self
            .store
            .node_ids_by_level(max_level)
            .take(2)
            .try_collect()
            .await?;
        let root_id = match ids.as_slice() {
            [only] => only.clone(),
            [] => {
                return Err(CanopyError::invariant(format!(
                    "max level {max_level} holds no nodes"
                )))
            }
            _ => {
                return Err(CanopyError::invariant(format!(
                    "multiple roots at level {max_level}"
                )))
            }
        };

        match self.store.get_node(&root_id).await? {
            Some(Node::Summary(node)) => Ok(Some(node)),
            Some(Node::Chunk(_)) => Err(CanopyError::invariant(format!(
                "root {root_id} at level {max_level} is a chunk"
            ))),
            None => Err(CanopyError::invariant(format!(
                "root {root_id} disappeared during lookup"
            ))),
        }
    }

    /// Rewrite a summary node's text following a user instruction
    pub async fn refine_node(&self, node_id: &NodeId, instruction: &str) -> CanopyResult<SummaryNode> {
        let summarizer = self.summarizer.as_ref().ok_or_else(|| {
            CanopyError::configuration("refinement requires a configured summarizer")
        })?;

        let trimmed = instruction.trim();
        if trimmed.is_empty() {
            return Err(CanopyError::validation("refinement instruction is empty"));
        }
        let length = trimmed.chars().count();
        if length > self.config.max_instruction_len {
            return Err(CanopyError::validation(format!(
                "refinement instruction has {length} characters, maximum is {}",
                self.config.max_instruction_len
            )));
        }

        node_id.validate()?;
        let node = match self.store.get_node(node_id).await? {
            None => return Err(CanopyError::NotFound(node_id.clone())),
            Some(Node::Chunk(_)) => return Err(CanopyError::NotASummary(node_id.clone())),
            Some(Node::Summary(node)) => node,
        };

        let sanitized = sanitize_instruction(trimmed);
        if sanitized.text.is_empty() {
            return Err(CanopyError::validation(
                "refinement instruction is empty after sanitizing",
            ));
        }

        self.apply_refinement(summarizer.as_ref(), node, &sanitized.text)
            .await
            .map_err(|e| CanopyError::refinement(node_id.clone(), sanitized.text.clone(), e))
    }

    async fn apply_refinement(
        &self,
        summarizer: &dyn Summarizer,
        mut node: SummaryNode,
        instruction: &str,
    ) -> CanopyResult<SummaryNode> {
        let context = self.gather_context(&node).await?;

        let options = SummarizeOptions {
            strategy: Some(REFINE_STRATEGY.to_string()),
            instruction: Some(instruction.to_string()),
            max_tokens: None,
        };
        let text = summarizer.summarize(&context, &options).await?;
        if text.trim().is_empty() {
            return Err(CanopyError::validation("summarizer returned blank text"));
        }

        let previous_text_len = node.text.chars().count();
        node.text = text;
        node.embedding = None;
        node.metadata.is_user_edited = true;
        node.metadata.record_refinement(
            RefinementRecord {
                instruction: instruction.to_string(),
                refined_at: Utc::now(),
                previous_text_len,
            },
            self.config.max_history,
        );

        let id = node.node_id();
        let node = Node::Summary(node);
        if !self.store.update_node(&node).await? {
            return Err(CanopyError::NotFound(id));
        }
        info!(node = %id, "Refined summary node");

        match node {
            Node::Summary(node) => Ok(node),
            Node::Chunk(_) => Err(CanopyError::invariant("refined node changed kind")),
        }
    }

    /// Direct children's text, blank-line separated, capped at `max_context_chars`
    async fn gather_context(&self, node: &SummaryNode) -> CanopyResult<String> {
        let children: Vec<Node> = self
            .store
            .get_nodes(node.children_indices.clone())
            .try_collect()
            .await?;
        if children.is_empty() {
            return Err(CanopyError::validation(format!(
                "summary {} has no retrievable children",
                node.id
            )));
        }

        let max = self.config.max_context_chars;
        let mut context = String::new();
        let mut used = 0usize;
        for child in &children {
            let separator = if context.is_empty() { "" } else { CHILD_SEPARATOR };
            let needed = separator.chars().count() + child.text().chars().count();
            if used + needed > max {
                let room = max.saturating_sub(used + separator.chars().count());
                if room > 0 {
                    context.push_str(separator);
                    context.extend(child.text().chars().take(room));
                }
                warn!(
                    node = %node.id,
                    max_context_chars = max,
                    "Refinement context truncated"
                );
                break;
            }
            context.push_str(separator);
            context.push_str(child.text());
            used += needed;
        }
        Ok(context)
    }
}
