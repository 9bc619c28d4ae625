//! Memory configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Loading order: JSON file, then `PROFILE_MEMORY_*` environment
//! overrides, then [`MemoryConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunker::TextSplitter;
use crate::embedding::RetryPolicy;
use crate::error::{MemoryError, Result};

/// Chunking policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters (default: 1000)
    pub chunk_size: usize,
    /// Characters repeated between adjacent chunks (default: 200)
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Query defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum results per query (default: 4)
    pub top_k: usize,
    /// Results must score strictly above this (default: 0.5)
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            similarity_threshold: 0.5,
        }
    }
}

/// Embedding adapter limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Texts per provider request (default: 64)
    pub max_batch_size: usize,
    /// Concurrent provider requests (default: 4)
    pub max_in_flight: usize,
    /// Per-request timeout (default: 30s)
    pub call_timeout_ms: u64,
    /// LRU entries, 0 disables the cache (default: 1024)
    pub cache_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_in_flight: 4,
            call_timeout_ms: 30_000,
            cache_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Top-level configuration for [`MemoryOrchestrator`](crate::MemoryOrchestrator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    /// Longest accepted document in characters (default: 200000)
    pub max_document_chars: usize,
    /// Timeout for every index call (default: 10s)
    pub index_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            max_document_chars: 200_000,
            index_timeout_ms: 10_000,
        }
    }
}

impl MemoryConfig {
    /// Load from a JSON file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `PROFILE_MEMORY_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("PROFILE_MEMORY_CHUNK_SIZE") {
            self.chunking.chunk_size = parse_var("PROFILE_MEMORY_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("PROFILE_MEMORY_CHUNK_OVERLAP") {
            self.chunking.chunk_overlap = parse_var("PROFILE_MEMORY_CHUNK_OVERLAP", &v)?;
        }
        if let Some(v) = get("PROFILE_MEMORY_TOP_K") {
            self.retrieval.top_k = parse_var("PROFILE_MEMORY_TOP_K", &v)?;
        }
        if let Some(v) = get("PROFILE_MEMORY_SIMILARITY_THRESHOLD") {
            self.retrieval.similarity_threshold =
                parse_var("PROFILE_MEMORY_SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = get("PROFILE_MEMORY_MAX_IN_FLIGHT") {
            self.embedding.max_in_flight = parse_var("PROFILE_MEMORY_MAX_IN_FLIGHT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        TextSplitter::new(self.chunking.chunk_size, self.chunking.chunk_overlap)?;

        let threshold = self.retrieval.similarity_threshold;
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(MemoryError::validation(format!(
                "similarity_threshold must be within [-1, 1], got {threshold}"
            )));
        }
        if self.embedding.max_batch_size == 0 {
            return Err(MemoryError::validation("max_batch_size must be positive"));
        }
        if self.embedding.max_in_flight == 0 {
            return Err(MemoryError::validation("max_in_flight must be positive"));
        }
        if self.embedding.call_timeout_ms == 0 || self.index_timeout_ms == 0 {
            return Err(MemoryError::validation("timeouts must be positive"));
        }
        if self.embedding.retry.max_attempts == 0 {
            return Err(MemoryError::validation("retry.max_attempts must be at least 1"));
        }
        if self.max_document_chars == 0 {
            return Err(MemoryError::validation("max_document_chars must be positive"));
        }
        Ok(())
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MemoryError::validation(format!("{name} has an invalid value: {value:?}")))
}
