//! Row encoding for nodes
//!
//! Node content is stored as JSON with the embedding stripped; the embedding
//! is stored as a blob of little-endian `f32` values.

use crate::error::{SqliteError, SqliteResult};
use canopy_core::{Chunk, Node, SummaryNode};

pub const CHUNK_TYPE: &str = "chunk";
pub const SUMMARY_TYPE: &str = "summary";

/// A node flattened into its column values
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: String,
    pub node_type: &'static str,
    pub level: u32,
    pub content: String,
    pub embedding: Option<Vec<u8>>,
}

pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> SqliteResult<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(SqliteError::Serialization(format!(
            "embedding blob of {} bytes is not a list of f32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Flatten a node into a record; the caller validates the node first
pub fn encode_node(node: &Node) -> SqliteResult<NodeRecord> {
    let embedding = node.embedding().map(encode_embedding);
    let (node_type, content) = match node {
        Node::Chunk(chunk) => {
            let stripped = Chunk {
                embedding: None,
                ..chunk.clone()
            };
            (CHUNK_TYPE, serde_json::to_string(&stripped)?)
        }
        Node::Summary(summary) => {
            let stripped = SummaryNode {
                embedding: None,
                ..summary.clone()
            };
            (SUMMARY_TYPE, serde_json::to_string(&stripped)?)
        }
    };

    Ok(NodeRecord {
        id: node.id().storage_key(),
        node_type,
        level: node.level(),
        content,
        embedding,
    })
}

/// Rebuild a node from its stored columns
pub fn decode_node(node_type: &str, content: &str, embedding: Option<&[u8]>) -> SqliteResult<Node> {
    let embedding = embedding.map(decode_embedding).transpose()?;
    match node_type {
        CHUNK_TYPE => {
            let mut chunk: Chunk = serde_json::from_str(content)?;
            chunk.embedding = embedding;
            Ok(Node::Chunk(chunk))
        }
        SUMMARY_TYPE => {
            let mut summary: SummaryNode = serde_json::from_str(content)?;
            summary.embedding = embedding;
            Ok(Node::Summary(summary))
        }
        other => Err(SqliteError::Serialization(format!(
            "unknown node type {other:?}"
        ))),
    }
}
