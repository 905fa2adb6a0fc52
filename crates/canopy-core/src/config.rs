//! Configuration with sensible defaults
//!
//! One immutable [`CanopyConfig`] value is built at startup (from TOML or
//! code) and its sections are handed to the constructors that need them.

use crate::error::{CanopyError, CanopyResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Clustering algorithms understood by the clustering engine
pub const SUPPORTED_ALGORITHMS: &[&str] = &["gmm", "kmeans"];

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanopyConfig {
    pub builder: BuilderConfig,
    pub clustering: ClusteringConfig,
    pub interactive: InteractiveConfig,
    pub store: StoreConfig,
}

impl CanopyConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> CanopyResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| CanopyError::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> CanopyResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CanopyError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> CanopyResult<()> {
        self.builder.validate()?;
        self.clustering.validate()?;
        self.interactive.validate()?;
        self.store.validate()
    }
}

fn require_positive(name: &str, value: usize) -> CanopyResult<()> {
    if value == 0 {
        return Err(CanopyError::configuration(format!("{name} must be > 0")));
    }
    Ok(())
}

/// Tree builder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Nodes per write/embedding batch
    pub write_batch_size: usize,
    /// Strategy name passed through to the summarizer
    pub summary_strategy: String,
    pub summary_max_tokens: Option<usize>,
    /// Keep every created summary node, without its embedding, in the returned tree
    pub collect_summaries: bool,
    /// Stop adding levels after this many; the last level is merged into one root
    pub max_levels: Option<u32>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            write_batch_size: 100,
            summary_strategy: "default".to_string(),
            summary_max_tokens: None,
            collect_summaries: true,
            max_levels: None,
        }
    }
}

impl BuilderConfig {
    pub fn validate(&self) -> CanopyResult<()> {
        require_positive("builder.write_batch_size", self.write_batch_size)?;
        if self.max_levels == Some(0) {
            return Err(CanopyError::configuration("builder.max_levels must be > 0"));
        }
        Ok(())
    }
}

/// Clustering engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// `gmm` (soft) or `kmeans` (hard, streaming)
    pub algorithm: String,
    /// Target dimension of the manifold reduction
    pub reduction_dim: usize,
    /// Neighborhood size; defaults to `sqrt(n - 1)`
    pub n_neighbors: Option<usize>,
    pub min_dist: f64,
    /// Membership probability a point needs to join a cluster
    pub threshold: f64,
    pub max_clusters: usize,
    /// Fixed component count; automatic BIC selection when unset
    pub n_components: Option<usize>,
    pub random_seed: u64,
    /// Inputs of at most this size are returned as a single cluster
    pub small_input_floor: usize,
    /// Inputs above this size take the streaming path
    pub large_scale_threshold: usize,
    /// Batch size of the streaming path
    pub batch_size: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub reduction_epochs: usize,
    pub kmeans_epochs: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            algorithm: "gmm".to_string(),
            reduction_dim: 10,
            n_neighbors: None,
            min_dist: 0.1,
            threshold: 0.1,
            max_clusters: 50,
            n_components: None,
            random_seed: 224,
            small_input_floor: 5,
            large_scale_threshold: 5000,
            batch_size: 1000,
            max_iter: 100,
            tol: 1e-3,
            reduction_epochs: 200,
            kmeans_epochs: 5,
        }
    }
}

impl ClusteringConfig {
    pub fn validate(&self) -> CanopyResult<()> {
        if !SUPPORTED_ALGORITHMS.contains(&self.algorithm.as_str()) {
            return Err(CanopyError::configuration(format!(
                "unknown clustering algorithm {:?} (supported: {})",
                self.algorithm,
                SUPPORTED_ALGORITHMS.join(", ")
            )));
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(CanopyError::configuration(
                "clustering.threshold must be in (0, 1)",
            ));
        }
        if !(self.min_dist >= 0.0 && self.min_dist.is_finite()) {
            return Err(CanopyError::configuration(
                "clustering.min_dist must be a finite non-negative number",
            ));
        }
        require_positive("clustering.reduction_dim", self.reduction_dim)?;
        require_positive("clustering.max_clusters", self.max_clusters)?;
        require_positive("clustering.batch_size", self.batch_size)?;
        require_positive("clustering.max_iter", self.max_iter)?;
        require_positive("clustering.kmeans_epochs", self.kmeans_epochs)?;
        if self.n_components == Some(0) {
            return Err(CanopyError::configuration(
                "clustering.n_components must be > 0",
            ));
        }
        if self.n_neighbors == Some(0) {
            return Err(CanopyError::configuration(
                "clustering.n_neighbors must be > 0",
            ));
        }
        Ok(())
    }
}

/// Interactive engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractiveConfig {
    pub max_instruction_len: usize,
    /// Maximum combined length of the children text sent with a refinement
    pub max_context_chars: usize,
    /// Refinement history entries kept per node
    pub max_history: usize,
    /// Maximum nodes in one breadth-first layer of a source-chunk descent
    pub max_frontier: usize,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            max_instruction_len: 2000,
            max_context_chars: 50_000,
            max_history: 10,
            max_frontier: 10_000,
        }
    }
}

impl InteractiveConfig {
    pub fn validate(&self) -> CanopyResult<()> {
        require_positive("interactive.max_instruction_len", self.max_instruction_len)?;
        require_positive("interactive.max_context_chars", self.max_context_chars)?;
        require_positive("interactive.max_history", self.max_history)?;
        require_positive("interactive.max_frontier", self.max_frontier)
    }
}

/// Store batching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Records per write transaction
    pub write_batch_size: usize,
    /// Ids per multi-lookup query and rows per streamed page
    pub read_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_batch_size: 500,
            read_batch_size: 500,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> CanopyResult<()> {
        require_positive("store.write_batch_size", self.write_batch_size)?;
        require_positive("store.read_batch_size", self.read_batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CanopyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.clustering.threshold, 0.1);
        assert_eq!(config.clustering.small_input_floor, 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CanopyConfig::from_toml_str(
            r#"
            [builder]
            write_batch_size = 16

            [clustering]
            threshold = 0.25
            n_components = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.builder.write_batch_size, 16);
        assert_eq!(config.builder.summary_strategy, "default");
        assert_eq!(config.clustering.threshold, 0.25);
        assert_eq!(config.clustering.n_components, Some(3));
        assert_eq!(config.clustering.random_seed, 224);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let err = CanopyConfig::from_toml_str("[clustering]\nalgorithm = \"dbscan\"\n").unwrap_err();
        assert!(matches!(err, CanopyError::Configuration(_)));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut config = CanopyConfig::default();
        config.store.read_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[interactive]\nmax_history = 4").unwrap();

        let config = CanopyConfig::load(file.path()).unwrap();
        assert_eq!(config.interactive.max_history, 4);
        assert!(CanopyConfig::load("/nonexistent/canopy.toml").is_err());
    }
}
