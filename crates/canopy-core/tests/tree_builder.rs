//! Integration tests for the tree builder using in-memory collaborators

use canopy_core::test_support::{
    init_test_tracing, EchoSummarizer, HashEmbedder, MemoryNodeStore, PairwiseClusterer,
    ParagraphChunker,
};
use canopy_core::{
    BuilderConfig, CanopyError, CanopyResult, Chunk, Cluster, Clusterer, Node, NodeId, NodeStore,
    TreeBuilder,
};
use futures::TryStreamExt;
use std::collections::HashSet;
use std::sync::Arc;

struct Harness {
    store: Arc<MemoryNodeStore>,
    embedder: Arc<HashEmbedder>,
    summarizer: Arc<EchoSummarizer>,
    builder: TreeBuilder,
}

fn harness_with(config: BuilderConfig, clusterer: Arc<dyn Clusterer>) -> Harness {
    init_test_tracing();
    let store = Arc::new(MemoryNodeStore::new());
    let embedder = Arc::new(HashEmbedder::new(16));
    let summarizer = Arc::new(EchoSummarizer::new());
    let builder = TreeBuilder::new(
        config,
        Arc::new(ParagraphChunker),
        embedder.clone(),
        summarizer.clone(),
        clusterer,
        store.clone(),
    );
    Harness {
        store,
        embedder,
        summarizer,
        builder,
    }
}

fn harness() -> Harness {
    harness_with(BuilderConfig::default(), Arc::new(PairwiseClusterer))
}

fn chunks(n: usize) -> Vec<CanopyResult<Chunk>> {
    (0..n)
        .map(|i| {
            let text = format!("Paragraph number {i} about topic {}", i % 3);
            let start = i * 100;
            Ok(Chunk::new(i as u64, text, start, start + 40))
        })
        .collect()
}

/// Collect every chunk index reachable from `id`
async fn leaves_under(store: &MemoryNodeStore, id: NodeId, out: &mut Vec<u64>) {
    let mut stack = vec![id];
    while let Some(id) = stack.pop() {
        match store.get_node(&id).await.unwrap().unwrap() {
            Node::Chunk(chunk) => out.push(chunk.index),
            Node::Summary(node) => stack.extend(node.children_indices),
        }
    }
}

#[tokio::test]
async fn test_eight_chunks_pairwise_gives_three_levels() {
    let h = harness();
    let tree = h.builder.build_from_chunks(chunks(8)).await.unwrap();

    assert_eq!(tree.root_node.level, 3);
    assert_eq!(tree.metadata.level_count, 4);
    assert_eq!(tree.metadata.chunk_count, 8);
    assert_eq!(tree.metadata.summary_count, 4 + 2 + 1);
    assert_eq!(h.store.node_count(1).await.unwrap(), 4);
    assert_eq!(h.store.node_count(2).await.unwrap(), 2);
    assert_eq!(h.store.node_count(3).await.unwrap(), 1);
    assert_eq!(h.summarizer.call_count(), 7);

    let summaries = tree.summaries.as_ref().unwrap();
    assert_eq!(summaries.len(), 7);
    assert!(summaries.contains_key(&tree.root_node.id));
}

#[tokio::test]
async fn test_leaf_ids_match_input_exactly() {
    let h = harness();
    let tree = h.builder.build_from_chunks(chunks(13)).await.unwrap();

    assert!(tree.root_node.level >= 1);
    assert_eq!(tree.leaf_chunk_ids, (0..13).collect::<Vec<u64>>());

    let mut reachable = Vec::new();
    leaves_under(&h.store, tree.root_node.node_id(), &mut reachable).await;
    reachable.sort_unstable();
    assert_eq!(reachable, (0..13).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_children_have_strictly_lower_levels() {
    let h = harness();
    let tree = h.builder.build_from_chunks(chunks(11)).await.unwrap();

    for node in tree.summaries.unwrap().values() {
        let children: Vec<Node> = h
            .store
            .get_nodes(node.children_indices.clone())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(children.len(), node.children_indices.len());
        for child in children {
            assert!(child.level() < node.level);
        }
        assert!(node.metadata.cluster_id.is_some());
    }
}

#[tokio::test]
async fn test_collected_summaries_leave_embeddings_in_the_store() {
    let h = harness();
    let tree = h.builder.build_from_chunks(chunks(9)).await.unwrap();

    let summaries = tree.summaries.unwrap();
    assert_eq!(summaries.len(), tree.metadata.summary_count);
    for (id, node) in &summaries {
        assert_eq!(node.embedding, None);
        let stored = h.store.get_node(&NodeId::summary(id)).await.unwrap().unwrap();
        assert_eq!(stored.text(), node.text);
        assert!(stored.embedding().is_some());
    }
    assert!(tree.root_node.embedding.is_some());
}

#[tokio::test]
async fn test_single_chunk_is_wrapped_in_level_one_root() {
    let h = harness();
    let tree = h
        .builder
        .build("Only one paragraph here.")
        .await
        .unwrap();

    assert_eq!(tree.root_node.level, 1);
    assert_eq!(tree.root_node.children_indices, vec![NodeId::Chunk(0)]);
    assert_eq!(tree.root_node.text, "Only one paragraph here.");
    assert!(tree.root_node.embedding.is_some());
    assert_eq!(h.summarizer.call_count(), 0);

    let stored = h.store.get_node(&tree.root_node.node_id()).await.unwrap();
    assert!(matches!(stored, Some(Node::Summary(_))));
}

#[tokio::test]
async fn test_empty_input_fails_before_any_work() {
    let h = harness();
    let err = h.builder.build("\n\n   \n\n").await.unwrap_err();

    assert!(matches!(err, CanopyError::EmptyInput));
    assert_eq!(h.embedder.chunk_calls(), 0);
    assert!(h.store.is_empty());
}

/// Returns one cluster per point, never reducing anything
struct IdentityClusterer;

impl Clusterer for IdentityClusterer {
    fn cluster(&self, embeddings: &[Vec<f32>], level: u32) -> CanopyResult<Vec<Cluster>> {
        Ok((0..embeddings.len())
            .map(|i| Cluster::new(i, level, vec![i]))
            .collect())
    }
}

#[tokio::test]
async fn test_no_reduction_forces_merge_and_terminates() {
    let h = harness_with(BuilderConfig::default(), Arc::new(IdentityClusterer));
    let tree = h.builder.build_from_chunks(chunks(6)).await.unwrap();

    assert_eq!(tree.root_node.level, 1);
    assert_eq!(tree.root_node.children_indices.len(), 6);
    assert_eq!(h.summarizer.call_count(), 1);
}

#[tokio::test]
async fn test_small_write_batches_cover_every_node() {
    let config = BuilderConfig {
        write_batch_size: 3,
        ..BuilderConfig::default()
    };
    let h = harness_with(config, Arc::new(PairwiseClusterer));
    let tree = h.builder.build_from_chunks(chunks(10)).await.unwrap();

    // 10 chunks in batches of 3 -> 4 embedding calls
    assert_eq!(h.embedder.chunk_calls(), 4);
    assert_eq!(h.store.node_count(0).await.unwrap(), 10);
    assert_eq!(tree.leaf_chunk_ids.len(), 10);
    // 10 -> 5 -> 3 -> 2 -> 1
    assert_eq!(tree.root_node.level, 4);
}

#[tokio::test]
async fn test_max_levels_caps_depth() {
    let config = BuilderConfig {
        max_levels: Some(2),
        ..BuilderConfig::default()
    };
    let h = harness_with(config, Arc::new(PairwiseClusterer));
    let tree = h.builder.build_from_chunks(chunks(8)).await.unwrap();

    assert_eq!(tree.root_node.level, 2);
    assert_eq!(tree.root_node.children_indices.len(), 4);
}

#[tokio::test]
async fn test_summarizer_failure_propagates() {
    let h = harness();
    h.summarizer.set_failing(true);

    let err = h.builder.build_from_chunks(chunks(4)).await.unwrap_err();
    assert!(matches!(err, CanopyError::Collaborator(_)));
}

#[tokio::test]
async fn test_duplicate_chunk_indices_rejected() {
    let h = harness();
    let input = vec![
        Ok(Chunk::new(0, "first", 0, 5)),
        Ok(Chunk::new(0, "again", 6, 11)),
    ];

    let err = h.builder.build_from_chunks(input).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_chunk_order_is_preserved_in_summaries() {
    let h = harness();
    let text = "alpha one\n\nbeta two\n\ngamma three\n\ndelta four";
    h.builder.build(text).await.unwrap();

    let calls = h.summarizer.calls();
    assert_eq!(calls[0].text, "alpha one\n\nbeta two");
    assert_eq!(calls[1].text, "gamma three\n\ndelta four");
    assert_eq!(calls[0].options.strategy.as_deref(), Some("default"));

    let ids: HashSet<NodeId> = h.store.node_ids_by_level(0).try_collect().await.unwrap();
    assert_eq!(ids.len(), 4);
}
