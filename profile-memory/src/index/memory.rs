//! In-process vector index
//!
//! One `DashMap` entry per owner. All writes for an owner happen under that
//! entry's shard lock, so readers see a batch entirely or not at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{check_query, validate_batch, Ranker, ScoredChunk, SearchParams, StoredChunk, VectorIndex};
use crate::chunk::{Chunk, ChunkId, MetadataFilter, OwnerId};
use crate::error::Result;
use crate::similarity::cosine_similarity;

type Partition = HashMap<ChunkId, StoredChunk>;

/// Ephemeral index backed by concurrent hash maps
#[derive(Default)]
pub struct InMemoryIndex {
    partitions: DashMap<OwnerId, Partition>,
    dimension: Mutex<Option<usize>>,
    seq: AtomicU64,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owners with at least one chunk
    pub fn owner_count(&self) -> usize {
        self.partitions.len()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn drop_if_empty(&self, owner: &OwnerId) {
        self.partitions.remove_if(owner, |_, partition| partition.is_empty());
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        {
            let mut dimension = self.dimension.lock();
            let checked = validate_batch(&chunks, *dimension)?;
            dimension.get_or_insert(checked);
        }

        let mut by_owner: HashMap<OwnerId, Vec<Chunk>> = HashMap::new();
        for chunk in chunks {
            by_owner.entry(chunk.owner_id.clone()).or_default().push(chunk);
        }

        for (owner, batch) in by_owner {
            let count = batch.len();
            let mut partition = self.partitions.entry(owner.clone()).or_default();
            for chunk in batch {
                let seq = self.next_seq();
                partition.insert(chunk.id, StoredChunk { chunk, seq });
            }
            log::debug!("Upserted {} chunk(s) for {}", count, owner);
        }

        Ok(())
    }

    async fn delete(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<usize> {
        let removed = match self.partitions.get_mut(owner) {
            Some(mut partition) => {
                let before = partition.len();
                partition.retain(|_, stored| !filter.matches(&stored.chunk.metadata));
                before - partition.len()
            }
            None => 0,
        };
        self.drop_if_empty(owner);
        Ok(removed)
    }

    async fn delete_ids(&self, owner: &OwnerId, ids: &[ChunkId]) -> Result<usize> {
        let removed = match self.partitions.get_mut(owner) {
            Some(mut partition) => ids
                .iter()
                .filter(|id| partition.remove(*id).is_some())
                .count(),
            None => 0,
        };
        self.drop_if_empty(owner);
        Ok(removed)
    }

    async fn list_ids(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<Vec<ChunkId>> {
        Ok(self
            .partitions
            .get(owner)
            .map(|partition| {
                partition
                    .values()
                    .filter(|stored| filter.matches(&stored.chunk.metadata))
                    .map(|stored| stored.chunk.id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, owner: &OwnerId, id: ChunkId) -> Result<Option<Chunk>> {
        Ok(self
            .partitions
            .get(owner)
            .and_then(|partition| partition.get(&id).map(|stored| stored.chunk.clone())))
    }

    async fn count(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<usize> {
        Ok(self
            .partitions
            .get(owner)
            .map(|partition| {
                partition
                    .values()
                    .filter(|stored| filter.matches(&stored.chunk.metadata))
                    .count()
            })
            .unwrap_or(0))
    }

    async fn search(
        &self,
        owner: &OwnerId,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<ScoredChunk>> {
        check_query(self.dimension(), query)?;
        if params.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut ranker = Ranker::new(params);
        if let Some(partition) = self.partitions.get(owner) {
            for stored in partition.values() {
                if !ranker.wants(&stored.chunk) {
                    continue;
                }
                if let Some(embedding) = &stored.chunk.embedding {
                    let similarity = cosine_similarity(query, embedding);
                    ranker.offer(similarity, stored.seq, &stored.chunk);
                }
            }
        }

        let hits = ranker.finish();
        log::debug!("Search for {} returned {} hit(s)", owner, hits.len());
        Ok(hits)
    }

    fn dimension(&self) -> Option<usize> {
        *self.dimension.lock()
    }
}
