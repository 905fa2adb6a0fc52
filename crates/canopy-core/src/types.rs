//! Domain types: chunks, summary nodes, node identifiers, clusters and the
//! finished document tree.

use crate::error::{CanopyError, CanopyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Maximum length of a summary node identifier
pub const MAX_ID_LEN: usize = 128;

/// Check that an identifier only uses `[A-Za-z0-9_-]`
pub fn validate_id(id: &str) -> CanopyResult<()> {
    if id.is_empty() {
        return Err(CanopyError::validation("node id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CanopyError::validation(format!(
            "node id exceeds {} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(CanopyError::validation(format!(
            "node id {:?} contains characters outside [A-Za-z0-9_-]",
            id
        )));
    }
    Ok(())
}

/// Identifier of a node in the tree
///
/// Chunks are identified by their index, summary nodes by an opaque string.
/// The storage key of a chunk is its decimal index, so summary ids must not be
/// purely numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    Chunk(u64),
    Summary(String),
}

impl NodeId {
    /// Create a summary node id
    pub fn summary(id: impl Into<String>) -> Self {
        Self::Summary(id.into())
    }

    /// Key under which the node is stored
    pub fn storage_key(&self) -> String {
        match self {
            Self::Chunk(index) => index.to_string(),
            Self::Summary(id) => id.clone(),
        }
    }

    /// Parse a storage key back into an id
    pub fn from_storage_key(key: &str) -> CanopyResult<Self> {
        if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
            let index = key
                .parse::<u64>()
                .map_err(|e| CanopyError::validation(format!("invalid chunk key {key:?}: {e}")))?;
            return Ok(Self::Chunk(index));
        }
        let id = Self::Summary(key.to_string());
        id.validate()?;
        Ok(id)
    }

    /// Validate the id against the safe character class
    pub fn validate(&self) -> CanopyResult<()> {
        match self {
            Self::Chunk(_) => Ok(()),
            Self::Summary(id) => {
                validate_id(id)?;
                if id.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(CanopyError::validation(format!(
                        "summary id {:?} must not be purely numeric",
                        id
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, Self::Chunk(_))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunk(index) => write!(f, "chunk:{index}"),
            Self::Summary(id) => write!(f, "summary:{id}"),
        }
    }
}

impl From<u64> for NodeId {
    fn from(index: u64) -> Self {
        Self::Chunk(index)
    }
}

fn validate_embedding(owner: &NodeId, embedding: &Option<Vec<f32>>) -> CanopyResult<()> {
    if let Some(vector) = embedding {
        if vector.is_empty() {
            return Err(CanopyError::validation(format!(
                "{owner} has an empty embedding"
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(CanopyError::validation(format!(
                "{owner} has a non-finite embedding value"
            )));
        }
    }
    Ok(())
}

/// Leaf text segment of the source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u64,
    pub text: String,
    /// Character offset of the first character
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Chunk {
    pub fn new(index: u64, text: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            index,
            text: text.into(),
            start,
            end,
            embedding: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn id(&self) -> NodeId {
        NodeId::Chunk(self.index)
    }

    pub fn validate(&self) -> CanopyResult<()> {
        if self.text.trim().is_empty() {
            return Err(CanopyError::validation(format!(
                "chunk {} has blank text",
                self.index
            )));
        }
        if self.start >= self.end {
            return Err(CanopyError::validation(format!(
                "chunk {} has invalid offsets {}..{}",
                self.index, self.start, self.end
            )));
        }
        validate_embedding(&self.id(), &self.embedding)
    }
}

/// DIKW classification of a summary node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DikwLevel {
    Data,
    Information,
    Knowledge,
    Wisdom,
}

impl DikwLevel {
    /// Classification for a node created at `level`
    pub fn for_level(level: u32) -> Self {
        match level {
            0 => Self::Data,
            1 => Self::Information,
            2 => Self::Knowledge,
            _ => Self::Wisdom,
        }
    }
}

/// One applied refinement instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRecord {
    pub instruction: String,
    pub refined_at: DateTime<Utc>,
    /// Length in characters of the text that was replaced
    pub previous_text_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub dikw_level: DikwLevel,
    #[serde(default)]
    pub is_user_edited: bool,
    #[serde(default)]
    pub refinement_history: Vec<RefinementRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<usize>,
}

impl SummaryMetadata {
    pub fn new(level: u32, cluster_id: Option<usize>) -> Self {
        Self {
            dikw_level: DikwLevel::for_level(level),
            is_user_edited: false,
            refinement_history: Vec::new(),
            cluster_id,
        }
    }

    /// Append a refinement, evicting the oldest entries beyond `max_history`
    pub fn record_refinement(&mut self, record: RefinementRecord, max_history: usize) {
        self.refinement_history.push(record);
        if self.refinement_history.len() > max_history {
            let excess = self.refinement_history.len() - max_history;
            self.refinement_history.drain(..excess);
        }
    }
}

/// Generated internal or root node summarizing a cluster of children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryNode {
    pub id: String,
    pub text: String,
    pub level: u32,
    pub children_indices: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: SummaryMetadata,
}

impl SummaryNode {
    /// Create a node with a fresh opaque id
    pub fn new(
        text: impl Into<String>,
        level: u32,
        children_indices: Vec<NodeId>,
        cluster_id: Option<usize>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            level,
            children_indices,
            embedding: None,
            metadata: SummaryMetadata::new(level, cluster_id),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::Summary(self.id.clone())
    }

    pub fn validate(&self) -> CanopyResult<()> {
        let id = self.node_id();
        id.validate()?;
        if self.level == 0 {
            return Err(CanopyError::validation(format!(
                "{id} has level 0, reserved for chunks"
            )));
        }
        if self.text.trim().is_empty() {
            return Err(CanopyError::validation(format!("{id} has blank text")));
        }
        for child in &self.children_indices {
            child.validate()?;
        }
        validate_embedding(&id, &self.embedding)
    }
}

/// A stored node of either kind
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Chunk(Chunk),
    Summary(SummaryNode),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Self::Chunk(chunk) => chunk.id(),
            Self::Summary(node) => node.node_id(),
        }
    }

    pub fn level(&self) -> u32 {
        match self {
            Self::Chunk(_) => 0,
            Self::Summary(node) => node.level,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Chunk(chunk) => &chunk.text,
            Self::Summary(node) => &node.text,
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            Self::Chunk(chunk) => chunk.embedding.as_deref(),
            Self::Summary(node) => node.embedding.as_deref(),
        }
    }

    /// Children of the node; chunks have none
    pub fn children(&self) -> &[NodeId] {
        match self {
            Self::Chunk(_) => &[],
            Self::Summary(node) => &node.children_indices,
        }
    }

    pub fn validate(&self) -> CanopyResult<()> {
        match self {
            Self::Chunk(chunk) => chunk.validate(),
            Self::Summary(node) => node.validate(),
        }
    }

    pub fn as_summary(&self) -> Option<&SummaryNode> {
        match self {
            Self::Summary(node) => Some(node),
            Self::Chunk(_) => None,
        }
    }

    pub fn into_chunk(self) -> Option<Chunk> {
        match self {
            Self::Chunk(chunk) => Some(chunk),
            Self::Summary(_) => None,
        }
    }
}

impl From<Chunk> for Node {
    fn from(chunk: Chunk) -> Self {
        Self::Chunk(chunk)
    }
}

impl From<SummaryNode> for Node {
    fn from(node: SummaryNode) -> Self {
        Self::Summary(node)
    }
}

/// Grouping produced by the clustering engine for one level
///
/// `node_indices` are positions into the embedding sequence handed to the
/// clusterer, not store ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: usize,
    pub level: u32,
    pub node_indices: Vec<usize>,
    pub centroid: Option<Vec<f32>>,
}

impl Cluster {
    pub fn new(id: usize, level: u32, node_indices: Vec<usize>) -> Self {
        Self {
            id,
            level,
            node_indices,
            centroid: None,
        }
    }

    pub fn len(&self) -> usize {
        self.node_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_indices.is_empty()
    }
}

/// Global facts about a finished tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    /// Number of levels including the chunk level
    pub level_count: u32,
    pub chunk_count: usize,
    pub summary_count: usize,
}

/// Result of a tree build
#[derive(Debug, Clone)]
pub struct DocumentTree {
    pub root_node: SummaryNode,
    pub leaf_chunk_ids: Vec<u64>,
    /// Summary nodes by id, without embeddings, when the builder was asked to collect them
    pub summaries: Option<HashMap<String, SummaryNode>>,
    pub metadata: TreeMetadata,
}

impl DocumentTree {
    /// Level of the root node
    pub fn depth(&self) -> u32 {
        self.root_node.level
    }
}
