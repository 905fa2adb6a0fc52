//! Error taxonomy shared by the tree builder, clustering engine and
//! interactive engine.

use crate::store::StoreError;
use crate::types::NodeId;
use thiserror::Error;

/// Top-level error type for Canopy operations
#[derive(Error, Debug)]
pub enum CanopyError {
    /// Malformed text, offsets, embeddings, ids or instructions
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unsupported algorithm, invalid setting or missing collaborator
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage failure, always carrying the operation context
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure while refining a node, with node and instruction context
    #[error("Refinement of node {node_id} failed (instruction: {instruction:?}): {source}")]
    Refinement {
        node_id: NodeId,
        instruction: String,
        #[source]
        source: Box<CanopyError>,
    },

    /// A state that the tree invariants rule out
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The chunk source produced nothing
    #[error("Empty input: the chunk source produced no chunks")]
    EmptyInput,

    /// The requested node does not exist
    #[error("Node not found: {0}")]
    NotFound(NodeId),

    /// The operation requires a summary node but the id names a chunk
    #[error("Node {0} is a chunk; chunks are immutable source material")]
    NotASummary(NodeId),

    /// Failure reported by an external collaborator (embedder, summarizer, chunker)
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

/// Result type for Canopy operations
pub type CanopyResult<T> = Result<T, CanopyError>;

impl CanopyError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Wrap an error raised while refining `node_id`
    pub fn refinement(node_id: NodeId, instruction: impl Into<String>, source: CanopyError) -> Self {
        Self::Refinement {
            node_id,
            instruction: instruction.into(),
            source: Box::new(source),
        }
    }

    /// Check if the error was raised by input validation
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::Refinement { source, .. } => source.is_validation(),
            _ => false,
        }
    }
}
