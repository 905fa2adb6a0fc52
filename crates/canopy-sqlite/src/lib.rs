//! SQLite storage backend for Canopy
//!
//! This crate provides a SQLite-based implementation of
//! [`canopy_core::NodeStore`].
//!
//! ## Features
//!
//! - **Single node table**: chunks and summary nodes keyed by storage key
//! - **Separate embeddings**: vectors live in their own column so embedding
//!   updates never rewrite node content
//! - **Bounded work**: batched write transactions, batched `IN` lookups and
//!   keyset-paged level streams
//! - **WAL Mode**: readers on other connections proceed during writes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canopy_core::{NodeStore, StoreConfig};
//! use canopy_sqlite::{SqliteConfig, SqliteNodeStore};
//!
//! let store = SqliteNodeStore::open(SqliteConfig::new("./canopy.db"), StoreConfig::default())?;
//! let root_level = store.max_level().await?;
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod node_store;
pub mod schema;

// Re-exports
pub use config::SqliteConfig;
pub use connection::{DbStats, SqlitePool};
pub use error::{SqliteError, SqliteResult};
pub use node_store::SqliteNodeStore;
