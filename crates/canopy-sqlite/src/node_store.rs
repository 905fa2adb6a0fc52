//! SQLite implementation of [`NodeStore`]
//!
//! All statements run on the blocking pool. Mutations go through the pool's
//! writer; lookups, level pages and counts go through its reader.
//! Writes are grouped into transactions of `write_batch_size` records;
//! multi-id lookups use one `IN (...)` query per `read_batch_size` ids, and
//! level enumeration pages through `seq` so no level is ever loaded whole.

use crate::codec::{decode_embedding, decode_node, encode_embedding, encode_node, NodeRecord};
use crate::config::SqliteConfig;
use crate::connection::SqlitePool;
use crate::error::{SqliteError, SqliteResult};
use async_trait::async_trait;
use canopy_core::{
    batched, batched_stream, check_id, Chunk, Node, NodeId, NodeStore, StoreConfig, StoreError,
    StoreResult, SummaryNode,
};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use tracing::debug;

const UPSERT_NODE: &str = "
    INSERT INTO nodes (id, node_type, level, content, embedding, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
    ON CONFLICT(id) DO UPDATE SET
        node_type = excluded.node_type,
        level = excluded.level,
        content = excluded.content,
        embedding = excluded.embedding,
        updated_at = excluded.updated_at";

const SELECT_LEVEL_PAGE: &str = "
    SELECT seq, id, embedding FROM nodes
    WHERE level = ?1 AND seq > ?2
    ORDER BY seq
    LIMIT ?3";

const SELECT_LEVEL_ID_PAGE: &str = "
    SELECT seq, id, NULL FROM nodes
    WHERE level = ?1 AND seq > ?2
    ORDER BY seq
    LIMIT ?3";

/// `(node_type, content, embedding)` as read from a row
type RawNode = (String, String, Option<Vec<u8>>);

/// One page of a level: its entries and the cursor of the next page
type LevelPage = (Vec<(NodeId, Option<Vec<f32>>)>, Option<i64>);

fn raw_node(row: &Row<'_>, offset: usize) -> rusqlite::Result<RawNode> {
    Ok((row.get(offset)?, row.get(offset + 1)?, row.get(offset + 2)?))
}

fn decode_raw((node_type, content, embedding): RawNode) -> SqliteResult<Node> {
    decode_node(&node_type, &content, embedding.as_deref())
}

fn join<T>(
    operation: &'static str,
    joined: Result<SqliteResult<T>, tokio::task::JoinError>,
) -> StoreResult<T> {
    joined
        .map_err(|e| StoreError::Task(e.to_string()).during(operation))?
        .map_err(|e| StoreError::from(e).during(operation))
}

/// Validate and encode nodes ahead of a write
fn encode_batch(nodes: impl IntoIterator<Item = Node>) -> StoreResult<Vec<NodeRecord>> {
    nodes
        .into_iter()
        .map(|node| {
            check_id(&node.id())?;
            node.validate()?;
            Ok(encode_node(&node)?)
        })
        .collect()
}

/// Node store persisted in a single SQLite database
#[derive(Clone)]
pub struct SqliteNodeStore {
    pool: SqlitePool,
    config: StoreConfig,
}

impl SqliteNodeStore {
    pub fn new(pool: SqlitePool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    /// Open (creating if needed) the database described by `sqlite`
    pub fn open(sqlite: SqliteConfig, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let pool = SqlitePool::new(sqlite)?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a query against the reader on the blocking pool
    async fn read<F, T>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        join(operation, tokio::task::spawn_blocking(move || pool.with_reader(f)).await)
    }

    /// Run a mutation against the writer on the blocking pool
    async fn write<F, T>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> SqliteResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        join(operation, tokio::task::spawn_blocking(move || pool.with_writer(f)).await)
    }

    async fn write_records(
        &self,
        operation: &'static str,
        records: Vec<NodeRecord>,
    ) -> StoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.write(operation, move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT_NODE)?;
                for record in &records {
                    stmt.execute(params![
                        record.id,
                        record.node_type,
                        record.level,
                        record.content,
                        record.embedding,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    /// Fetch one batch of ids, in request order
    async fn fetch_batch(&self, ids: Vec<NodeId>) -> StoreResult<Vec<Node>> {
        let keys: Vec<String> = ids.iter().map(NodeId::storage_key).collect();
        self.read("get_nodes", move |conn| {
            let placeholders = vec!["?"; keys.len()].join(", ");
            let sql = format!(
                "SELECT id, node_type, content, embedding FROM nodes WHERE id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(keys.iter()), |row| {
                Ok((row.get::<_, String>(0)?, raw_node(row, 1)?))
            })?;

            let mut found: HashMap<String, Node> = HashMap::with_capacity(keys.len());
            for row in rows {
                let (key, raw) = row?;
                found.insert(key, decode_raw(raw)?);
            }
            Ok(keys.iter().filter_map(|key| found.get(key).cloned()).collect())
        })
        .await
    }

    /// Read the page of `level` after `cursor`; `None` ends the stream
    async fn next_level_page(
        &self,
        level: u32,
        cursor: Option<i64>,
        with_embeddings: bool,
    ) -> StoreResult<Option<LevelPage>> {
        let Some(after) = cursor else {
            return Ok(None);
        };
        let limit = self.config.read_batch_size.max(1);
        let sql = if with_embeddings {
            SELECT_LEVEL_PAGE
        } else {
            SELECT_LEVEL_ID_PAGE
        };

        let rows = self
            .read("level_page", move |conn| {
                let mut stmt = conn.prepare_cached(sql)?;
                let rows = stmt.query_map(params![level, after, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                })?;

                let mut page = Vec::with_capacity(limit);
                for row in rows {
                    let (seq, key, blob) = row?;
                    let id = NodeId::from_storage_key(&key)
                        .map_err(|e| SqliteError::Serialization(e.to_string()))?;
                    let embedding = blob.as_deref().map(decode_embedding).transpose()?;
                    page.push((seq, id, embedding));
                }
                Ok(page)
            })
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let next = if rows.len() < limit {
            None
        } else {
            rows.last().map(|(seq, _, _)| *seq)
        };
        let entries = rows
            .into_iter()
            .map(|(_, id, embedding)| (id, embedding))
            .collect();
        Ok(Some((entries, next)))
    }

    fn level_pages(
        &self,
        level: u32,
        with_embeddings: bool,
    ) -> BoxStream<'_, StoreResult<(NodeId, Option<Vec<f32>>)>> {
        stream::try_unfold(Some(0i64), move |cursor| {
            self.next_level_page(level, cursor, with_embeddings)
        })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, StoreError>)))
        .try_flatten()
        .boxed()
    }
}

#[async_trait]
impl NodeStore for SqliteNodeStore {
    async fn add_chunks(&self, chunks: BoxStream<'_, Chunk>) -> StoreResult<usize> {
        let mut batches = batched_stream(chunks, self.config.write_batch_size);
        let mut written = 0;
        while let Some(batch) = batches.next().await {
            let records = encode_batch(batch.into_iter().map(Node::Chunk))?;
            written += self.write_records("add_chunks", records).await?;
        }
        debug!(written, "Stored chunks");
        Ok(written)
    }

    async fn add_summaries(&self, nodes: BoxStream<'_, SummaryNode>) -> StoreResult<usize> {
        let mut batches = batched_stream(nodes, self.config.write_batch_size);
        let mut written = 0;
        while let Some(batch) = batches.next().await {
            let records = encode_batch(batch.into_iter().map(Node::Summary))?;
            written += self.write_records("add_summaries", records).await?;
        }
        debug!(written, "Stored summary nodes");
        Ok(written)
    }

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<Node>> {
        check_id(id)?;
        let key = id.storage_key();
        self.read("get_node", move |conn| {
            conn.query_row(
                "SELECT node_type, content, embedding FROM nodes WHERE id = ?1",
                [&key],
                |row| raw_node(row, 0),
            )
            .optional()?
            .map(decode_raw)
            .transpose()
        })
        .await
    }

    fn get_nodes(&self, ids: Vec<NodeId>) -> BoxStream<'_, StoreResult<Node>> {
        if let Err(e) = ids.iter().try_for_each(check_id) {
            return stream::once(async move { Err(e) }).boxed();
        }
        stream::iter(batched(ids, self.config.read_batch_size))
            .then(move |batch| self.fetch_batch(batch))
            .map_ok(|nodes| stream::iter(nodes.into_iter().map(Ok::<_, StoreError>)))
            .try_flatten()
            .boxed()
    }

    async fn update_node(&self, node: &Node) -> StoreResult<bool> {
        check_id(&node.id())?;
        node.validate()?;
        let record = encode_node(node)?;
        self.write("update_node", move |conn| {
            let rows = conn.execute(
                "UPDATE nodes
                 SET node_type = ?2, level = ?3, content = ?4, embedding = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    record.id,
                    record.node_type,
                    record.level,
                    record.content,
                    record.embedding,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(rows > 0)
        })
        .await
    }

    async fn set_embeddings(&self, embeddings: Vec<(NodeId, Vec<f32>)>) -> StoreResult<usize> {
        let mut rows = Vec::with_capacity(embeddings.len());
        for (id, vector) in &embeddings {
            check_id(id)?;
            if vector.is_empty() {
                return Err(StoreError::serialization(format!("{id} has an empty embedding")));
            }
            rows.push((id.storage_key(), encode_embedding(vector)));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        self.write("set_embeddings", move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE nodes SET embedding = ?2, updated_at = ?3 WHERE id = ?1",
                )?;
                for (key, blob) in &rows {
                    updated += stmt.execute(params![key, blob, now])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    fn node_ids_by_level(&self, level: u32) -> BoxStream<'_, StoreResult<NodeId>> {
        self.level_pages(level, false)
            .map_ok(|(id, _)| id)
            .boxed()
    }

    fn level_embeddings(
        &self,
        level: u32,
    ) -> BoxStream<'_, StoreResult<(NodeId, Option<Vec<f32>>)>> {
        self.level_pages(level, true)
    }

    async fn max_level(&self) -> StoreResult<u32> {
        self.read("max_level", |conn| {
            Ok(conn.query_row("SELECT COALESCE(MAX(level), 0) FROM nodes", [], |row| {
                row.get(0)
            })?)
        })
        .await
    }

    async fn node_count(&self, level: u32) -> StoreResult<usize> {
        let count: i64 = self
            .read("node_count", move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM nodes WHERE level = ?1",
                    [level],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::RefinementRecord;

    fn store_with(read_batch_size: usize, write_batch_size: usize) -> SqliteNodeStore {
        let pool = SqlitePool::memory().unwrap();
        SqliteNodeStore::new(
            pool,
            StoreConfig {
                write_batch_size,
                read_batch_size,
            },
        )
    }

    fn store() -> SqliteNodeStore {
        store_with(500, 500)
    }

    fn chunks(n: u64) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(i, format!("chunk {i}"), 0, 7).with_embedding(vec![i as f32, 1.0]))
            .collect()
    }

    fn summary(id: &str, level: u32, children: Vec<NodeId>) -> SummaryNode {
        SummaryNode {
            id: id.to_string(),
            ..SummaryNode::new(format!("summary {id}"), level, children, Some(0))
        }
    }

    #[tokio::test]
    async fn test_chunk_round_trip() {
        let store = store();
        let mut chunk = Chunk::new(4, "Some text.", 10, 20).with_embedding(vec![0.5, -0.25, 2.0]);
        chunk
            .metadata
            .insert("source".to_string(), serde_json::json!("notes.md"));

        let written = store
            .add_chunks(stream::iter(vec![chunk.clone()]).boxed())
            .await
            .unwrap();
        assert_eq!(written, 1);

        let loaded = store.get_node(&NodeId::Chunk(4)).await.unwrap();
        assert_eq!(loaded, Some(Node::Chunk(chunk)));
    }

    #[tokio::test]
    async fn test_summary_round_trip_keeps_metadata() {
        let store = store();
        let mut node = summary("s-1", 2, vec![NodeId::Chunk(0), NodeId::summary("s-0")]);
        node.embedding = Some(vec![1.0, 2.0]);
        node.metadata.is_user_edited = true;
        node.metadata.record_refinement(
            RefinementRecord {
                instruction: "shorter".to_string(),
                refined_at: Utc::now(),
                previous_text_len: 42,
            },
            10,
        );

        store
            .add_summaries(stream::iter(vec![node.clone()]).boxed())
            .await
            .unwrap();

        let loaded = store.get_node(&node.node_id()).await.unwrap();
        assert_eq!(loaded, Some(Node::Summary(node)));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = store_with(500, 3);
        for _ in 0..2 {
            let written = store
                .add_chunks(stream::iter(chunks(7)).boxed())
                .await
                .unwrap();
            assert_eq!(written, 7);
        }
        assert_eq!(store.node_count(0).await.unwrap(), 7);
        assert_eq!(store.pool().stats().unwrap().node_count, 7);
    }

    #[tokio::test]
    async fn test_invalid_summary_rejects_batch() {
        let store = store();
        let bad = SummaryNode {
            text: "   ".to_string(),
            ..summary("s-blank", 1, vec![])
        };
        let result = store
            .add_summaries(stream::iter(vec![summary("s-ok", 1, vec![]), bad]).boxed())
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(store.node_count(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_absent_node_writes_nothing() {
        let store = store();
        let node = Node::Summary(summary("s-missing", 1, vec![NodeId::Chunk(0)]));

        assert!(!store.update_node(&node).await.unwrap());
        assert_eq!(store.get_node(&node.id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_replaces_text_and_embedding() {
        let store = store();
        let mut node = summary("s-1", 1, vec![NodeId::Chunk(0)]);
        node.embedding = Some(vec![1.0]);
        store
            .add_summaries(stream::iter(vec![node.clone()]).boxed())
            .await
            .unwrap();

        node.text = "rewritten".to_string();
        node.embedding = None;
        assert!(store.update_node(&Node::Summary(node.clone())).await.unwrap());

        let loaded = store.get_node(&node.node_id()).await.unwrap().unwrap();
        assert_eq!(loaded.text(), "rewritten");
        assert_eq!(loaded.embedding(), None);
    }

    #[tokio::test]
    async fn test_set_embeddings_leaves_content() {
        let store = store();
        store
            .add_chunks(stream::iter(chunks(3)).boxed())
            .await
            .unwrap();

        let updated = store
            .set_embeddings(vec![
                (NodeId::Chunk(1), vec![9.0, 9.0, 9.0]),
                (NodeId::Chunk(99), vec![1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let node = store.get_node(&NodeId::Chunk(1)).await.unwrap().unwrap();
        assert_eq!(node.text(), "chunk 1");
        assert_eq!(node.embedding(), Some(&[9.0, 9.0, 9.0][..]));
    }

    #[tokio::test]
    async fn test_level_streams_page_in_insertion_order() {
        let store = store_with(2, 500);
        store
            .add_chunks(stream::iter(chunks(5)).boxed())
            .await
            .unwrap();
        store
            .add_summaries(stream::iter(vec![summary("s-a", 1, vec![NodeId::Chunk(0)])]).boxed())
            .await
            .unwrap();

        let ids: Vec<NodeId> = store.node_ids_by_level(0).try_collect().await.unwrap();
        assert_eq!(ids, (0..5).map(NodeId::Chunk).collect::<Vec<_>>());

        let pairs: Vec<(NodeId, Option<Vec<f32>>)> =
            store.level_embeddings(0).try_collect().await.unwrap();
        assert_eq!(pairs.len(), 5);
        assert_eq!(pairs[3], (NodeId::Chunk(3), Some(vec![3.0, 1.0])));

        let summaries: Vec<(NodeId, Option<Vec<f32>>)> =
            store.level_embeddings(1).try_collect().await.unwrap();
        assert_eq!(summaries, vec![(NodeId::summary("s-a"), None)]);

        let empty: Vec<NodeId> = store.node_ids_by_level(7).try_collect().await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_get_nodes_keeps_request_order_and_skips_missing() {
        let store = store_with(2, 500);
        store
            .add_chunks(stream::iter(chunks(6)).boxed())
            .await
            .unwrap();

        let ids = vec![
            NodeId::Chunk(5),
            NodeId::Chunk(42),
            NodeId::Chunk(0),
            NodeId::Chunk(3),
            NodeId::summary("s-none"),
        ];
        let nodes: Vec<Node> = store.get_nodes(ids).try_collect().await.unwrap();
        let found: Vec<NodeId> = nodes.iter().map(Node::id).collect();
        assert_eq!(found, vec![NodeId::Chunk(5), NodeId::Chunk(0), NodeId::Chunk(3)]);
    }

    #[tokio::test]
    async fn test_invalid_id_fails_before_io() {
        let store = store();
        let bad = NodeId::summary("x'; DROP TABLE nodes; --");

        assert!(matches!(
            store.get_node(&bad).await,
            Err(StoreError::InvalidId(_))
        ));
        let result: StoreResult<Vec<Node>> = store.get_nodes(vec![bad]).try_collect().await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));

        let written = store
            .add_summaries(stream::iter(vec![summary("bad id", 1, vec![])]).boxed())
            .await;
        assert!(matches!(written, Err(StoreError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_max_level_and_counts() {
        let store = store();
        assert_eq!(store.max_level().await.unwrap(), 0);

        store
            .add_chunks(stream::iter(chunks(4)).boxed())
            .await
            .unwrap();
        store
            .add_summaries(
                stream::iter(vec![
                    summary("s-a", 1, vec![NodeId::Chunk(0), NodeId::Chunk(1)]),
                    summary("s-b", 1, vec![NodeId::Chunk(2), NodeId::Chunk(3)]),
                    summary("s-root", 2, vec![NodeId::summary("s-a"), NodeId::summary("s-b")]),
                ])
                .boxed(),
            )
            .await
            .unwrap();

        assert_eq!(store.max_level().await.unwrap(), 2);
        assert_eq!(store.node_count(0).await.unwrap(), 4);
        assert_eq!(store.node_count(1).await.unwrap(), 2);
        assert_eq!(store.node_count(2).await.unwrap(), 1);
    }
}
