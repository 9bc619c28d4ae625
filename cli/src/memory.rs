//! Memory store setup for the CLI
//!
//! Opens the RocksDB index under the data directory and wires it to the
//! selected embedding provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::ValueEnum;
use profile_memory::{
    EmbeddingProvider, HashingEmbedder, HttpEmbeddingProvider, HttpProviderConfig, MemoryConfig,
    MemoryOrchestrator, RocksIndex,
};

/// Which embedding provider backs the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Deterministic offline feature hashing
    Local,
    /// OpenAI-compatible service configured through EMBEDDING_* variables
    Http,
}

/// Everything needed to open a store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub data_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub provider: ProviderKind,
    pub dimension: Option<usize>,
}

/// Open the orchestrator described by `options`
///
/// Creates the data directory if needed. Config comes from the optional
/// JSON file plus `PROFILE_MEMORY_*` overrides.
///
/// # Errors
/// Returns error if the config is invalid, the index cannot be opened, or
/// the provider dimension disagrees with vectors already stored.
pub fn open(options: &StoreOptions) -> anyhow::Result<MemoryOrchestrator> {
    let config = MemoryConfig::load(options.config.as_deref()).with_context(|| match &options.config {
        Some(path) => format!("invalid config {}", path.display()),
        None => "invalid configuration".to_string(),
    })?;

    let index_dir = index_dir(&options.data_dir);
    tracing::debug!("Opening index at {:?}", index_dir);
    let index = RocksIndex::open(&index_dir)
        .with_context(|| format!("failed to open index at {}", index_dir.display()))?;

    let provider = provider(options.provider, options.dimension)?;
    tracing::info!(
        "Using {:?} provider {} ({}d)",
        options.provider,
        provider.model_name(),
        provider.dimension()
    );

    MemoryOrchestrator::new(config, provider, Arc::new(index))
        .context("failed to initialise memory orchestrator")
}

fn index_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("index")
}

fn provider(kind: ProviderKind, dimension: Option<usize>) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    Ok(match kind {
        ProviderKind::Local => Arc::new(HashingEmbedder::new(
            dimension.unwrap_or(HashingEmbedder::DEFAULT_DIMENSION),
        )),
        ProviderKind::Http => {
            let mut config = HttpProviderConfig::from_env()?;
            if let Some(dimension) = dimension {
                config.dimension = dimension;
            }
            Arc::new(HttpEmbeddingProvider::new(config)?)
        }
    })
}
