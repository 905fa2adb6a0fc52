//! End-to-end tests against a file-backed SQLite store

use canopy_cluster::ClusteringEngine;
use canopy_core::test_support::{init_test_tracing, EchoSummarizer, HashEmbedder, ParagraphChunker};
use canopy_core::{
    BuilderConfig, Chunk, ClusteringConfig, InteractiveConfig, InteractiveEngine, NodeId,
    NodeStore, StoreConfig, TreeBuilder,
};
use canopy_sqlite::{SqliteConfig, SqliteNodeStore};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::{mpsc, Arc};
use std::thread;
use tempfile::TempDir;

fn open(dir: &TempDir) -> SqliteNodeStore {
    init_test_tracing();
    SqliteNodeStore::open(
        SqliteConfig::new(dir.path().join("tree.db")),
        StoreConfig {
            write_batch_size: 4,
            read_batch_size: 3,
        },
    )
    .unwrap()
}

fn document(paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| {
            format!(
                "Paragraph {i} discusses topic {} with detail number {}.",
                i % 3,
                i * 7
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[tokio::test]
async fn test_file_store_uses_wal() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);

    let mode: String = store
        .pool()
        .with_reader(|conn| Ok(conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0))?))
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
    assert!(store.pool().has_reader());
}

#[tokio::test]
async fn test_second_connection_sees_committed_writes() {
    let dir = TempDir::new().unwrap();
    let writer = open(&dir);
    let reader = open(&dir);

    let chunks: Vec<Chunk> = (0..10)
        .map(|i| Chunk::new(i, format!("chunk {i}"), 0, 7))
        .collect();
    let written = writer.add_chunks(stream::iter(chunks).boxed()).await.unwrap();
    assert_eq!(written, 10);

    assert_eq!(reader.node_count(0).await.unwrap(), 10);
    let ids: Vec<NodeId> = reader.node_ids_by_level(0).try_collect().await.unwrap();
    assert_eq!(ids, (0..10).map(NodeId::Chunk).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_reads_proceed_while_a_write_is_open() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    store
        .add_chunks(stream::iter(vec![Chunk::new(0, "kept", 0, 4)]).boxed())
        .await
        .unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let pool = store.pool().clone();
    let holder = thread::spawn(move || {
        pool.with_writer(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM nodes", [])?;
            locked_tx.send(()).ok();
            release_rx.recv().ok();
            tx.commit()?;
            Ok(())
        })
    });
    locked_rx.recv().unwrap();

    let node = store.get_node(&NodeId::Chunk(0)).await.unwrap();
    assert_eq!(node.map(|n| n.text().to_string()), Some("kept".to_string()));
    assert_eq!(store.node_count(0).await.unwrap(), 1);

    release_tx.send(()).unwrap();
    holder.join().unwrap().unwrap();
    assert_eq!(store.node_count(0).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reopened_store_keeps_nodes() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir);
        store
            .add_chunks(stream::iter(vec![Chunk::new(0, "kept", 0, 4)]).boxed())
            .await
            .unwrap();
    }

    let store = open(&dir);
    let node = store.get_node(&NodeId::Chunk(0)).await.unwrap().unwrap();
    assert_eq!(node.text(), "kept");
}

#[tokio::test]
async fn test_build_and_navigate_persisted_tree() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir));
    let summarizer = Arc::new(EchoSummarizer::new());

    let builder = TreeBuilder::new(
        BuilderConfig::default(),
        Arc::new(ParagraphChunker),
        Arc::new(HashEmbedder::new(16)),
        summarizer.clone(),
        Arc::new(ClusteringEngine::new(ClusteringConfig::default()).unwrap()),
        store.clone(),
    );

    let tree = builder.build(&document(12)).await.unwrap();
    assert_eq!(tree.leaf_chunk_ids, (0..12).collect::<Vec<u64>>());
    assert!(tree.depth() >= 1);
    assert_eq!(store.node_count(0).await.unwrap(), 12);
    assert_eq!(store.max_level().await.unwrap(), tree.depth());

    let engine = InteractiveEngine::new(InteractiveConfig::default(), store.clone(), Some(summarizer));
    let root = engine.get_root_node().await.unwrap().unwrap();
    assert_eq!(root.id, tree.root_node.id);

    let mut sources: Vec<u64> = engine
        .get_source_chunks(&root.node_id(), None)
        .map_ok(|chunk| chunk.index)
        .try_collect()
        .await
        .unwrap();
    sources.sort_unstable();
    assert_eq!(sources, (0..12).collect::<Vec<u64>>());

    let refined = engine
        .refine_node(&root.node_id(), "Keep it brief.")
        .await
        .unwrap();
    assert_eq!(refined.metadata.refinement_history.len(), 1);

    let reloaded = store.get_node(&root.node_id()).await.unwrap().unwrap();
    assert_eq!(reloaded.as_summary(), Some(&refined));
}

#[tokio::test]
async fn test_default_clustering_keeps_the_tree_shallow() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir));
    let summarizer = Arc::new(EchoSummarizer::new());

    let builder = TreeBuilder::new(
        BuilderConfig::default(),
        Arc::new(ParagraphChunker),
        Arc::new(HashEmbedder::new(16)),
        summarizer.clone(),
        Arc::new(ClusteringEngine::new(ClusteringConfig::default()).unwrap()),
        store.clone(),
    );

    let tree = builder.build(&document(30)).await.unwrap();
    assert_eq!(tree.leaf_chunk_ids.len(), 30);
    assert!(
        tree.depth() <= 4,
        "30 chunks built a tree of depth {} with {} summarizer calls",
        tree.depth(),
        summarizer.call_count()
    );
    assert!(store.node_count(1).await.unwrap() <= 15);
}
