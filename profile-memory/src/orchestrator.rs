//! Memory orchestrator
//!
//! Composes chunker, embedding adapter and vector index into the three
//! operations agents and collaborators use: ingest a document, resync a
//! document type, and query.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::chunk::{
    Chunk, ChunkId, ChunkMetadata, DocumentType, MetadataFilter, MetadataValue, OwnerId, OWNER_KEY,
};
use crate::chunker::TextSplitter;
use crate::config::MemoryConfig;
use crate::embedding::{CachedEmbedder, EmbeddingProvider, ResilientEmbedder};
use crate::error::{MemoryError, Result};
use crate::index::{ScoredChunk, SearchParams, VectorIndex};

/// Source recorded on chunks written by [`MemoryOrchestrator::sync_user_profile`]
pub const PROFILE_SOURCE: &str = "user_profile";

/// Extra metadata key holding a chunk's position within its document
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

type LockKey = (OwnerId, DocumentType);

/// Per-query overrides of the configured retrieval defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

impl QueryOptions {
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Outcome of a resync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub doc_type: DocumentType,
    /// Ids of the chunks now representing the document
    pub inserted: Vec<ChunkId>,
    /// Chunks of the previous version that were removed
    pub removed: usize,
}

/// Per-owner counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerStats {
    pub owner_id: OwnerId,
    pub total_chunks: usize,
    pub by_type: BTreeMap<DocumentType, usize>,
    pub model: String,
    pub dimension: usize,
}

/// Retrieval-augmented memory for a set of tenants
///
/// Both collaborators are injected: any [`EmbeddingProvider`] and any
/// [`VectorIndex`]. The provider is wrapped in a [`CachedEmbedder`] (when
/// `cache_capacity > 0`) and a [`ResilientEmbedder`].
///
/// Writes for the same `(owner, document type)` are serialised; queries
/// take no lock.
pub struct MemoryOrchestrator {
    config: MemoryConfig,
    splitter: TextSplitter,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl MemoryOrchestrator {
    /// Create a new orchestrator
    ///
    /// # Errors
    /// `Validation` for an invalid config, `DimensionMismatch` when the
    /// index already holds vectors of another dimension than the provider's.
    pub fn new(
        config: MemoryConfig,
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        config.validate()?;
        let splitter = TextSplitter::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?;

        if let Some(expected) = index.dimension() {
            if expected != provider.dimension() {
                return Err(MemoryError::DimensionMismatch {
                    expected,
                    actual: provider.dimension(),
                });
            }
        }

        let provider: Arc<dyn EmbeddingProvider> = if config.embedding.cache_capacity > 0 {
            Arc::new(CachedEmbedder::new(provider, config.embedding.cache_capacity))
        } else {
            provider
        };
        let embedder = Arc::new(ResilientEmbedder::new(provider, &config.embedding));

        log::info!(
            "MemoryOrchestrator ready (model: {}, {}d, chunk {}/{})",
            embedder.model_name(),
            embedder.dimension(),
            config.chunking.chunk_size,
            config.chunking.chunk_overlap
        );

        Ok(Self {
            config,
            splitter,
            embedder,
            index,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Ingest a document
    ///
    /// Splits `content`, embeds every chunk and writes them in one index
    /// call. A failure before that call leaves nothing behind.
    ///
    /// # Arguments
    /// * `owner` - Tenant the chunks belong to
    /// * `content` - Document text
    /// * `metadata` - Type, source and extra keys copied onto every chunk
    ///
    /// # Returns
    /// Ids of the new chunks, in document order
    pub async fn add_document(
        &self,
        owner: &str,
        content: &str,
        metadata: ChunkMetadata,
    ) -> Result<Vec<ChunkId>> {
        let owner = OwnerId::new(owner)?;
        self.check_content(content)?;
        let metadata = stamp_owner(&owner, metadata)?;

        let _lock = self.lock(&owner, metadata.doc_type).await;
        let chunks = self.embed_document(&owner, content, &metadata).await?;
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();

        self.within("upsert", self.index.upsert(chunks)).await?;

        log::info!(
            "Ingested {} chunk(s) of {} for {}",
            ids.len(),
            metadata.doc_type,
            owner
        );
        Ok(ids)
    }

    /// Replace the owner's profile chunks with `profile_text`
    pub async fn sync_user_profile(&self, owner: &str, profile_text: &str) -> Result<SyncReport> {
        self.resync_document(
            owner,
            profile_text,
            ChunkMetadata::new(DocumentType::Profile, PROFILE_SOURCE),
        )
        .await
    }

    /// Replace every chunk of `metadata.doc_type` for `owner`
    ///
    /// New chunks are written before the old ones are removed, so a
    /// concurrent reader sees the old version, both, or the new one, but
    /// never nothing. Blank `content` removes the type entirely.
    ///
    /// # Errors
    /// If the final removal fails the error is returned and the old chunks
    /// stay next to the new ones until the next resync.
    pub async fn resync_document(
        &self,
        owner: &str,
        content: &str,
        metadata: ChunkMetadata,
    ) -> Result<SyncReport> {
        let owner = OwnerId::new(owner)?;
        let metadata = stamp_owner(&owner, metadata)?;
        let doc_type = metadata.doc_type;
        let of_type = MetadataFilter::for_type(doc_type);

        let _lock = self.lock(&owner, doc_type).await;

        if content.trim().is_empty() {
            let removed = self.within("delete", self.index.delete(&owner, &of_type)).await?;
            log::info!("Cleared {} chunk(s) of {} for {}", removed, doc_type, owner);
            return Ok(SyncReport {
                doc_type,
                inserted: Vec::new(),
                removed,
            });
        }
        self.check_content(content)?;

        let old_ids = self
            .within("list", self.index.list_ids(&owner, &of_type))
            .await?;
        let chunks = self.embed_document(&owner, content, &metadata).await?;
        let inserted: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();

        self.within("upsert", self.index.upsert(chunks)).await?;

        let removed = match self
            .within("delete", self.index.delete_ids(&owner, &old_ids))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                log::error!(
                    "Resync of {} for {} left {} stale chunk(s): {}",
                    doc_type,
                    owner,
                    old_ids.len(),
                    e
                );
                return Err(e);
            }
        };

        log::info!(
            "Resynced {} for {}: {} new chunk(s), {} removed",
            doc_type,
            owner,
            inserted.len(),
            removed
        );
        Ok(SyncReport {
            doc_type,
            inserted,
            removed,
        })
    }

    /// Retrieve the text of the chunks most relevant to `text`
    ///
    /// # Arguments
    /// * `owner` - Tenant to search
    /// * `text` - Query text
    /// * `top_k` - Maximum results (configured default when `None`)
    ///
    /// # Returns
    /// Chunk contents, most similar first; empty when nothing clears the
    /// similarity threshold
    pub async fn query(&self, owner: &str, text: &str, top_k: Option<usize>) -> Result<Vec<String>> {
        let options = QueryOptions {
            top_k,
            ..QueryOptions::default()
        };
        Ok(self
            .query_detailed(owner, text, options)
            .await?
            .into_iter()
            .map(|hit| hit.chunk.content)
            .collect())
    }

    /// Like [`query`](Self::query) but returns whole chunks with scores
    pub async fn query_detailed(
        &self,
        owner: &str,
        text: &str,
        options: QueryOptions,
    ) -> Result<Vec<ScoredChunk>> {
        let owner = OwnerId::new(owner)?;
        let params = SearchParams {
            top_k: options.top_k.unwrap_or(self.config.retrieval.top_k),
            similarity_threshold: options
                .similarity_threshold
                .unwrap_or(self.config.retrieval.similarity_threshold),
            filter: options.filter,
        };

        if text.trim().is_empty() || params.top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed_one(text).await?;
        let hits = self
            .within("search", self.index.search(&owner, &vector, &params))
            .await?;

        log::debug!("Query for {} matched {} chunk(s)", owner, hits.len());
        Ok(hits)
    }

    /// Remove every chunk of one document type
    pub async fn delete_document(&self, owner: &str, doc_type: DocumentType) -> Result<usize> {
        let owner = OwnerId::new(owner)?;
        let _lock = self.lock(&owner, doc_type).await;
        let removed = self
            .within(
                "delete",
                self.index.delete(&owner, &MetadataFilter::for_type(doc_type)),
            )
            .await?;
        log::info!("Deleted {} chunk(s) of {} for {}", removed, doc_type, owner);
        Ok(removed)
    }

    /// Remove specific chunks; ids of other owners are ignored
    pub async fn delete_chunks(&self, owner: &str, ids: &[ChunkId]) -> Result<usize> {
        let owner = OwnerId::new(owner)?;
        self.within("delete", self.index.delete_ids(&owner, ids)).await
    }

    pub async fn get_chunk(&self, owner: &str, id: ChunkId) -> Result<Option<Chunk>> {
        let owner = OwnerId::new(owner)?;
        self.within("get", self.index.get(&owner, id)).await
    }

    pub async fn stats(&self, owner: &str) -> Result<OwnerStats> {
        let owner = OwnerId::new(owner)?;

        let mut by_type = BTreeMap::new();
        for doc_type in DocumentType::ALL {
            let count = self
                .within(
                    "count",
                    self.index.count(&owner, &MetadataFilter::for_type(doc_type)),
                )
                .await?;
            if count > 0 {
                by_type.insert(doc_type, count);
            }
        }

        Ok(OwnerStats {
            owner_id: owner,
            total_chunks: by_type.values().sum(),
            by_type,
            model: self.embedder.model_name().to_string(),
            dimension: self.embedder.dimension(),
        })
    }

    fn check_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(MemoryError::validation("content is empty"));
        }
        let len = content.chars().count();
        if len > self.config.max_document_chars {
            return Err(MemoryError::validation(format!(
                "content has {} characters, limit is {}",
                len, self.config.max_document_chars
            )));
        }
        Ok(())
    }

    /// Split and embed a document into ready-to-write chunks
    async fn embed_document(
        &self,
        owner: &OwnerId,
        content: &str,
        metadata: &ChunkMetadata,
    ) -> Result<Vec<Chunk>> {
        let texts = self.splitter.split(content);
        if texts.is_empty() {
            return Err(MemoryError::validation("content produced no chunks"));
        }

        let vectors = self.embedder.embed_batch(&texts).await.map_err(|e| {
            log::error!("Embedding {} chunk(s) for {} failed: {}", texts.len(), owner, e);
            MemoryError::from(e)
        })?;

        let created_at = Utc::now();
        texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| {
                let metadata = metadata.clone().with(CHUNK_INDEX_KEY, i as i64);
                Chunk::builder()
                    .owner(owner.clone())
                    .content(text)
                    .embedding(vector)
                    .metadata(metadata)
                    .created_at(created_at)
                    .build()
                    .map_err(MemoryError::from)
            })
            .collect()
    }

    /// Bound an index call by the configured timeout
    async fn within<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.index_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| MemoryError::index(format!("index {op} timed out after {timeout:?}")))?
    }

    async fn lock(&self, owner: &OwnerId, doc_type: DocumentType) -> KeyLock {
        let key = (owner.clone(), doc_type);
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyLock {
            guard: Some(mutex.lock_owned().await),
            locks: Arc::clone(&self.locks),
            key,
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.len()
    }
}

/// Holds a per-(owner, type) write lock; removes the map entry once unused
struct KeyLock {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
    key: LockKey,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Write the owner into the metadata, rejecting a conflicting one
fn stamp_owner(owner: &OwnerId, metadata: ChunkMetadata) -> Result<ChunkMetadata> {
    match metadata.owner_id() {
        Some(MetadataValue::String(existing)) if existing == owner.as_str() => Ok(metadata),
        Some(other) => Err(MemoryError::validation(format!(
            "metadata owner_id {other} does not match owner {owner}"
        ))),
        None => Ok(metadata.with(OWNER_KEY, owner.as_str())),
    }
}
