//! Vector index
//!
//! The [`VectorIndex`] capability and its two engines: [`InMemoryIndex`]
//! for tests and ephemeral use, [`RocksIndex`] for persistence.
//!
//! Every operation is scoped by owner. Search scores chunks by cosine
//! similarity, keeps those strictly above the threshold and returns them
//! most similar first, breaking ties by the most recent write.

mod memory;
mod rocks;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkId, MetadataFilter, OwnerId};
use crate::error::{MemoryError, Result};

pub use memory::InMemoryIndex;
pub use rocks::RocksIndex;

/// Search parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub top_k: usize,
    /// Results must score strictly above this
    pub similarity_threshold: f32,
    pub filter: Option<MetadataFilter>,
}

impl SearchParams {
    pub fn new(top_k: usize, similarity_threshold: f32) -> Self {
        Self {
            top_k,
            similarity_threshold,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::new(4, 0.5)
    }
}

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f32,
}

/// Owner-scoped chunk storage with similarity search
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace chunks by `(owner, id)`. Each owner's part of the
    /// batch becomes visible at once.
    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<()>;

    /// Remove every chunk of `owner` matching `filter`
    async fn delete(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<usize>;

    /// Remove the listed chunks of `owner`; unknown ids are ignored
    async fn delete_ids(&self, owner: &OwnerId, ids: &[ChunkId]) -> Result<usize>;

    async fn list_ids(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<Vec<ChunkId>>;

    async fn get(&self, owner: &OwnerId, id: ChunkId) -> Result<Option<Chunk>>;

    async fn count(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<usize>;

    async fn search(
        &self,
        owner: &OwnerId,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<ScoredChunk>>;

    /// Vector dimension, fixed by the first write
    fn dimension(&self) -> Option<usize>;
}

/// Chunk plus its write sequence number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredChunk {
    pub chunk: Chunk,
    pub seq: u64,
}

/// Check a batch before it is written and return its dimension
///
/// All chunks must be embedded, share one dimension, and match the index
/// dimension when it is already fixed.
pub(crate) fn validate_batch(chunks: &[Chunk], fixed: Option<usize>) -> Result<usize> {
    let mut dimension = fixed;

    for chunk in chunks {
        let Some(embedding) = &chunk.embedding else {
            return Err(MemoryError::validation(format!(
                "chunk {} has no embedding",
                chunk.id
            )));
        };
        if embedding.is_empty() {
            return Err(MemoryError::validation(format!(
                "chunk {} has an empty embedding",
                chunk.id
            )));
        }
        match dimension {
            Some(expected) if expected != embedding.len() => {
                return Err(MemoryError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
            Some(_) => {}
            None => dimension = Some(embedding.len()),
        }
    }

    dimension.ok_or_else(|| MemoryError::validation("empty batch"))
}

/// Check a query vector against the index dimension
pub(crate) fn check_query(fixed: Option<usize>, query: &[f32]) -> Result<()> {
    match fixed {
        Some(expected) if expected != query.len() => Err(MemoryError::DimensionMismatch {
            expected,
            actual: query.len(),
        }),
        _ => Ok(()),
    }
}

/// Collects scored candidates and keeps the best `top_k`
pub(crate) struct Ranker<'a> {
    params: &'a SearchParams,
    hits: Vec<(f32, u64, Chunk)>,
}

impl<'a> Ranker<'a> {
    pub fn new(params: &'a SearchParams) -> Self {
        Self {
            params,
            hits: Vec::new(),
        }
    }

    /// Whether a chunk with this metadata is a candidate at all
    pub fn wants(&self, chunk: &Chunk) -> bool {
        self.params
            .filter
            .as_ref()
            .map_or(true, |f| f.matches(&chunk.metadata))
    }

    /// Offer a candidate; the chunk is only cloned when it clears the threshold
    pub fn offer(&mut self, similarity: f32, seq: u64, chunk: &Chunk) {
        if similarity > self.params.similarity_threshold {
            self.hits.push((similarity, seq, chunk.clone()));
        }
    }

    /// Offer an owned candidate
    pub fn offer_owned(&mut self, similarity: f32, seq: u64, chunk: Chunk) {
        if similarity > self.params.similarity_threshold {
            self.hits.push((similarity, seq, chunk));
        }
    }

    pub fn finish(mut self) -> Vec<ScoredChunk> {
        self.hits.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        self.hits.truncate(self.params.top_k);
        self.hits
            .into_iter()
            .map(|(similarity, _, chunk)| ScoredChunk { chunk, similarity })
            .collect()
    }
}
