//! Error types for SQLite storage

use canopy_core::StoreError;
use thiserror::Error;

/// SQLite storage error type
#[derive(Error, Debug)]
pub enum SqliteError {
    /// Database could not be opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),

    /// Schema/migration error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Stored content could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Result type for SQLite operations
pub type SqliteResult<T> = Result<T, SqliteError>;

impl From<serde_json::Error> for SqliteError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Connection(msg) => Self::Connection(msg),
            SqliteError::Schema(msg) => Self::Connection(format!("schema: {msg}")),
            SqliteError::Query(msg) => Self::backend("query", msg),
            SqliteError::Serialization(msg) => Self::Serialization(msg),
            SqliteError::Rusqlite(e) => Self::backend("sqlite", e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_kind() {
        let err: StoreError = SqliteError::Connection("no such dir".into()).into();
        assert!(matches!(err, StoreError::Connection(_)));

        let err: StoreError = SqliteError::Serialization("bad json".into()).into();
        assert!(matches!(err, StoreError::Serialization(_)));

        let err: StoreError = SqliteError::Rusqlite(rusqlite::Error::QueryReturnedNoRows).into();
        assert!(matches!(err, StoreError::Backend { .. }));
    }
}
