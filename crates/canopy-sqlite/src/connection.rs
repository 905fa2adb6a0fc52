//! SQLite connections for the node store
//!
//! A file-backed WAL database gets two connections: a writer that owns the
//! schema and every mutation, and a `query_only` reader. Lookups and level
//! pages go to the reader, so a tree build's write transactions never hold up
//! navigation reads on the same store. In-memory databases are private to one
//! connection, so reads and writes share the writer there.

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqliteResult};
use crate::schema;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{debug, info};

/// Writer and reader connections to one database
#[derive(Clone)]
pub struct SqlitePool {
    writer: Arc<Mutex<Connection>>,
    /// `None` when reads share the writer
    reader: Option<Arc<Mutex<Connection>>>,
    config: SqliteConfig,
}

impl SqlitePool {
    /// Open the database, apply migrations and open the reader if one is used
    pub fn new(config: SqliteConfig) -> SqliteResult<Self> {
        info!(path = ?config.path, "Opening SQLite node store");

        let writer = open_connection(&config)?;
        configure_pragmas(&writer, &config)?;
        schema::apply_migrations(&writer)?;

        let reader = if config.uses_reader() {
            let reader = open_connection(&config)?;
            configure_pragmas(&reader, &config)?;
            reader.execute_batch("PRAGMA query_only = ON;")?;
            debug!("Opened read connection");
            Some(Arc::new(Mutex::new(reader)))
        } else {
            None
        };

        info!(separate_reader = reader.is_some(), "SQLite database initialized");
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader,
            config,
        })
    }

    /// Private in-memory database
    pub fn memory() -> SqliteResult<Self> {
        Self::new(SqliteConfig::memory())
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Run a read against the reader, or the writer when there is none
    pub fn with_reader<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let conn = self.reader.as_ref().unwrap_or(&self.writer).lock();
        f(&conn)
    }

    /// Run a mutation against the writer
    pub fn with_writer<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&mut Connection) -> SqliteResult<T>,
    {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }

    /// Page and node counts as seen by the reader
    pub fn stats(&self) -> SqliteResult<DbStats> {
        self.with_reader(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count;", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size;", [], |row| row.get(0))?;
            let node_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;

            Ok(DbStats {
                total_size_bytes: (page_count * page_size) as u64,
                node_count: node_count as u64,
            })
        })
    }
}

fn open_connection(config: &SqliteConfig) -> SqliteResult<Connection> {
    if config.is_memory() {
        return Connection::open_in_memory().map_err(|e| SqliteError::Connection(e.to_string()));
    }
    if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| SqliteError::Connection(format!("Failed to create directory: {}", e)))?;
    }
    Connection::open(&config.path)
        .map_err(|e| SqliteError::Connection(format!("{}: {}", config.path.display(), e)))
}

fn configure_pragmas(conn: &Connection, config: &SqliteConfig) -> SqliteResult<()> {
    // Busy timeout first so a concurrent WAL switch waits instead of failing
    conn.execute_batch(&format!("PRAGMA busy_timeout = {};", config.busy_timeout_ms))?;

    if config.wal_mode {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }

    conn.execute_batch(&format!("PRAGMA cache_size = {};", config.cache_size))?;
    if config.mmap_size > 0 {
        conn.execute_batch(&format!("PRAGMA mmap_size = {};", config.mmap_size))?;
    }
    conn.execute_batch("PRAGMA temp_store = MEMORY;")?;
    Ok(())
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub total_size_bytes: u64,
    pub node_count: u64,
}
