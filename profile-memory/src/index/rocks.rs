//! RocksDB vector index
//!
//! Persistent storage for chunks using RocksDB with LZ4 compression. Search
//! is an exact scan over the owner's key range.
//!
//! All writes go through one `WriteBatch` under a writer mutex, so a batch
//! is the single commit point. Reads iterate through RocksDB's implicit
//! snapshot and never see half a batch. Blocking calls run on
//! `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use super::{check_query, validate_batch, Ranker, ScoredChunk, SearchParams, StoredChunk, VectorIndex};
use crate::chunk::{Chunk, ChunkId, MetadataFilter, OwnerId};
use crate::error::{MemoryError, Result};
use crate::migration::{self, CHUNK_PREFIX, DIMENSION_KEY, SEQ_KEY};
use crate::similarity::cosine_similarity;

fn owner_prefix(owner: &OwnerId) -> Vec<u8> {
    format!("{CHUNK_PREFIX}{owner}\0").into_bytes()
}

fn chunk_key(owner: &OwnerId, id: ChunkId) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

fn encode(stored: &StoredChunk) -> Result<Vec<u8>> {
    bincode::serialize(stored)
        .map_err(|e| MemoryError::index(format!("failed to encode chunk {}: {e}", stored.chunk.id)))
}

fn decode(key: &[u8], bytes: &[u8]) -> Result<StoredChunk> {
    bincode::deserialize(bytes).map_err(|e| {
        MemoryError::index(format!(
            "corrupt chunk record {}: {e}",
            String::from_utf8_lossy(key)
        ))
    })
}

struct Inner {
    db: DB,
    /// Serialises writers; readers never take it
    writer: Mutex<()>,
    dimension: RwLock<Option<usize>>,
    seq: AtomicU64,
}

impl Inner {
    /// Visit every decodable record of `owner`, returning how many were skipped
    fn scan_owner(&self, owner: &OwnerId, mut visit: impl FnMut(&[u8], StoredChunk)) -> Result<usize> {
        let prefix = owner_prefix(owner);
        let mut skipped = 0;
        for item in self.db.iterator(IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            match decode(&key, &value) {
                Ok(stored) => visit(&key, stored),
                Err(e) => {
                    log::warn!("{}. Skipping.", e);
                    skipped += 1;
                }
            }
        }
        Ok(skipped)
    }
}

/// RocksDB-backed vector index
pub struct RocksIndex {
    inner: Arc<Inner>,
    path: PathBuf,
}

impl RocksIndex {
    /// Open or create an index at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        // Run migration if needed before opening database
        migration::migrate_if_needed(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;

        if migration::read_version(&db)?.is_none() {
            migration::stamp_current(&db)?;
        }
        let dimension = migration::read_u64(&db, DIMENSION_KEY)?.map(|d| d as usize);
        let seq = migration::read_u64(&db, SEQ_KEY)?.unwrap_or(0);

        log::info!(
            "RocksIndex opened at: {} (dimension: {:?})",
            path.display(),
            dimension
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                writer: Mutex::new(()),
                dimension: RwLock::new(dimension),
                seq: AtomicU64::new(seq),
            }),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking closure against the database
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| MemoryError::index(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl VectorIndex for RocksIndex {
    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        self.blocking(move |inner| {
            let _guard = inner.writer.lock();

            let fixed = *inner.dimension.read();
            let dimension = validate_batch(&chunks, fixed)?;

            let mut seq = inner.seq.load(Ordering::SeqCst);
            let mut batch = WriteBatch::default();
            let count = chunks.len();
            for chunk in chunks {
                seq += 1;
                let key = chunk_key(&chunk.owner_id, chunk.id);
                batch.put(key, encode(&StoredChunk { chunk, seq })?);
            }
            batch.put(SEQ_KEY, seq.to_le_bytes());
            if fixed.is_none() {
                batch.put(DIMENSION_KEY, (dimension as u64).to_le_bytes());
            }

            inner.db.write(batch)?;
            inner.seq.store(seq, Ordering::SeqCst);
            if fixed.is_none() {
                *inner.dimension.write() = Some(dimension);
            }

            log::debug!("Upserted {} chunk(s)", count);
            Ok(())
        })
        .await
    }

    async fn delete(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<usize> {
        let owner = owner.clone();
        let filter = filter.clone();

        self.blocking(move |inner| {
            let _guard = inner.writer.lock();

            let mut batch = WriteBatch::default();
            let mut removed = 0;
            let skipped = inner.scan_owner(&owner, |key, stored| {
                if filter.matches(&stored.chunk.metadata) {
                    batch.delete(key);
                    removed += 1;
                }
            })?;
            if skipped > 0 {
                log::error!(
                    "Delete for {} left {} undecodable record(s) in place",
                    owner,
                    skipped
                );
            }

            if removed > 0 {
                inner.db.write(batch)?;
            }
            Ok(removed)
        })
        .await
    }

    async fn delete_ids(&self, owner: &OwnerId, ids: &[ChunkId]) -> Result<usize> {
        let owner = owner.clone();
        let ids = ids.to_vec();

        self.blocking(move |inner| {
            let _guard = inner.writer.lock();

            let mut batch = WriteBatch::default();
            let mut removed = 0;
            for id in ids {
                let key = chunk_key(&owner, id);
                if inner.db.get_pinned(&key)?.is_some() {
                    batch.delete(&key);
                    removed += 1;
                }
            }

            if removed > 0 {
                inner.db.write(batch)?;
            }
            Ok(removed)
        })
        .await
    }

    async fn list_ids(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<Vec<ChunkId>> {
        let owner = owner.clone();
        let filter = filter.clone();

        self.blocking(move |inner| {
            let mut ids = Vec::new();
            inner.scan_owner(&owner, |_, stored| {
                if filter.matches(&stored.chunk.metadata) {
                    ids.push(stored.chunk.id);
                }
            })?;
            Ok(ids)
        })
        .await
    }

    async fn get(&self, owner: &OwnerId, id: ChunkId) -> Result<Option<Chunk>> {
        let key = chunk_key(owner, id);

        self.blocking(move |inner| match inner.db.get_pinned(&key)? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?.chunk)),
            None => Ok(None),
        })
        .await
    }

    async fn count(&self, owner: &OwnerId, filter: &MetadataFilter) -> Result<usize> {
        let owner = owner.clone();
        let filter = filter.clone();

        self.blocking(move |inner| {
            let mut count = 0;
            inner.scan_owner(&owner, |_, stored| {
                if filter.matches(&stored.chunk.metadata) {
                    count += 1;
                }
            })?;
            Ok(count)
        })
        .await
    }

    async fn search(
        &self,
        owner: &OwnerId,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<ScoredChunk>> {
        check_query(self.dimension(), query)?;
        if params.top_k == 0 || self.dimension().is_none() {
            return Ok(Vec::new());
        }

        let owner = owner.clone();
        let query = query.to_vec();
        let params = params.clone();

        self.blocking(move |inner| {
            let mut ranker = Ranker::new(&params);
            inner.scan_owner(&owner, |_, stored| {
                if !ranker.wants(&stored.chunk) {
                    return;
                }
                if let Some(embedding) = &stored.chunk.embedding {
                    let similarity = cosine_similarity(&query, embedding);
                    ranker.offer_owned(similarity, stored.seq, stored.chunk);
                }
            })?;

            let hits = ranker.finish();
            log::debug!("Search for {} returned {} hit(s)", owner, hits.len());
            Ok(hits)
        })
        .await
    }

    fn dimension(&self) -> Option<usize> {
        *self.inner.dimension.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DocumentType;
    use crate::index::testing::{chunk, exercise_contract, exercise_recency_ties, owner};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_contract() {
        let dir = TempDir::new().unwrap();
        let index = RocksIndex::open(dir.path()).unwrap();
        exercise_contract(&index).await;
    }

    #[tokio::test]
    async fn test_recency_ties() {
        let dir = TempDir::new().unwrap();
        let index = RocksIndex::open(dir.path()).unwrap();
        exercise_recency_ties(&index).await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_data_dimension_and_sequence() {
        let dir = TempDir::new().unwrap();
        let older = chunk("frank", "older", DocumentType::Resume, vec![0.0, 1.0]);

        {
            let index = RocksIndex::open(dir.path()).unwrap();
            index.upsert(vec![older.clone()]).await.unwrap();
        }

        let index = RocksIndex::open(dir.path()).unwrap();
        assert_eq!(index.dimension(), Some(2));
        assert_eq!(
            index.get(&owner("frank"), older.id).await.unwrap(),
            Some(older.clone())
        );

        // sequence continues after reopen, so the new chunk wins the tie
        let newer = chunk("frank", "newer", DocumentType::Resume, vec![0.0, 1.0]);
        index.upsert(vec![newer.clone()]).await.unwrap();
        let hits = index
            .search(&owner("frank"), &[0.0, 1.0], &SearchParams::new(2, 0.0))
            .await
            .unwrap();
        assert_eq!(hits[0].chunk.id, newer.id);
        assert_eq!(hits[1].chunk.id, older.id);
    }

    #[tokio::test]
    async fn test_owner_prefixes_do_not_overlap() {
        let dir = TempDir::new().unwrap();
        let index = RocksIndex::open(dir.path()).unwrap();

        index
            .upsert(vec![
                chunk("ann", "short owner", DocumentType::Profile, vec![1.0]),
                chunk("anna", "longer owner", DocumentType::Profile, vec![1.0]),
            ])
            .await
            .unwrap();

        let all = MetadataFilter::new();
        assert_eq!(index.count(&owner("ann"), &all).await.unwrap(), 1);
        assert_eq!(index.count(&owner("anna"), &all).await.unwrap(), 1);
        let hits = index
            .search(&owner("ann"), &[1.0], &SearchParams::new(10, 0.0))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.content, "short owner");
    }

    #[tokio::test]
    async fn test_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let index = RocksIndex::open(dir.path()).unwrap();
        let gina = owner("gina");

        let good = chunk("gina", "readable", DocumentType::Resume, vec![1.0, 0.0]);
        index.upsert(vec![good.clone()]).await.unwrap();
        let broken = ChunkId::new();
        index.inner.db.put(chunk_key(&gina, broken), b"").unwrap();

        match index.get(&gina, broken).await {
            Err(MemoryError::IndexUnavailable(msg)) => assert!(msg.contains("corrupt")),
            other => panic!("Expected IndexUnavailable, got {other:?}"),
        }

        let skipped = index.inner.scan_owner(&gina, |_, _| {}).unwrap();
        assert_eq!(skipped, 1);

        let removed = index
            .delete(&gina, &MetadataFilter::for_type(DocumentType::Resume))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.get(&gina, good.id).await.unwrap(), None);
        assert!(index.inner.db.get(chunk_key(&gina, broken)).unwrap().is_some());
    }

    #[test]
    fn test_fresh_database_is_stamped() {
        let dir = TempDir::new().unwrap();
        let index = RocksIndex::open(dir.path()).unwrap();
        assert_eq!(
            migration::read_version(&index.inner.db).unwrap(),
            Some(migration::CURRENT_VERSION)
        );
        assert_eq!(index.path(), dir.path());
    }
}
