//! Test support utilities
//!
//! Deterministic in-memory implementations of the collaborator and store
//! traits, available to other crates through the `test-utils` feature.

pub mod mocks;

pub use mocks::{
    EchoSummarizer, HashEmbedder, MemoryNodeStore, PairwiseClusterer, ParagraphChunker,
    SummarizerCall,
};

/// Install a fmt subscriber writing to the test harness, honoring `RUST_LOG`
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
