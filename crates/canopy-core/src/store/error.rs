//! Storage Error Types

use crate::error::CanopyError;
use crate::types::NodeId;
use thiserror::Error;

/// Error type for node store operations
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backing engine could not be opened or configured
    #[error("Store connection error: {0}")]
    Connection(String),

    /// A read or write failed
    #[error("Store error during {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An identifier failed validation before any I/O
    #[error("Invalid node id: {0}")]
    InvalidId(String),

    /// A node's content failed validation before any I/O
    #[error("Invalid node: {0}")]
    Validation(String),

    /// A blocking storage task could not be joined
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Create a backend error for `operation`
    pub fn backend<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }

    /// Add operation context to errors that lack it
    pub fn during(self, operation: &str) -> Self {
        match self {
            Self::Backend { message, .. } => Self::backend(operation, message),
            Self::Serialization(msg) => Self::backend(operation, format!("serialization: {msg}")),
            Self::Task(msg) => Self::backend(operation, format!("task: {msg}")),
            other => other,
        }
    }
}

/// Validate `id` ahead of a lookup or write
pub fn check_id(id: &NodeId) -> StoreResult<()> {
    id.validate().map_err(|err| match err {
        CanopyError::Validation(msg) => StoreError::InvalidId(msg),
        other => StoreError::from(other),
    })
}

impl From<CanopyError> for StoreError {
    fn from(err: CanopyError) -> Self {
        match err {
            CanopyError::Store(inner) => inner,
            CanopyError::Validation(msg) => Self::Validation(msg),
            other => Self::backend("store", other.to_string()),
        }
    }
}
