//! Database schema and migrations
//!
//! Handles format migrations to preserve stored chunks across versions.
//!
//! Layout (v2):
//! - `chunk:{owner}\0{id}` → bincode `StoredChunk`
//! - `meta:dimension` → u64 LE
//! - `meta:seq` → u64 LE, last assigned write sequence
//! - `_db_version` → u32 LE
//!
//! v1 stored JSON-encoded chunks under the same keys, without sequence
//! numbers or a version key.

use std::path::Path;

use rocksdb::{IteratorMode, Options, WriteBatch, DB};

use crate::chunk::Chunk;
use crate::error::{MemoryError, Result};
use crate::index::StoredChunk;

/// Database version stored in metadata
pub(crate) const DB_VERSION_KEY: &[u8] = b"_db_version";
pub const CURRENT_VERSION: u32 = 2;

pub(crate) const CHUNK_PREFIX: &str = "chunk:";
pub(crate) const DIMENSION_KEY: &[u8] = b"meta:dimension";
pub(crate) const SEQ_KEY: &[u8] = b"meta:seq";

/// Check if database needs migration and perform if needed
pub fn migrate_if_needed(db_path: impl AsRef<Path>) -> Result<()> {
    let path = db_path.as_ref();

    // Database not initialized yet (no CURRENT file)
    if !path.join("CURRENT").exists() {
        log::debug!(
            "No existing database found at {}, skipping migration",
            path.display()
        );
        return Ok(());
    }

    let mut opts = Options::default();
    opts.create_if_missing(false);
    let db = DB::open(&opts, path)
        .map_err(|e| MemoryError::index(format!("Failed to open database for migration: {e}")))?;

    let current_version = read_version(&db)?.unwrap_or(1);

    log::info!(
        "Database version: {} (current: {})",
        current_version,
        CURRENT_VERSION
    );

    if current_version > CURRENT_VERSION {
        return Err(MemoryError::index(format!(
            "Database version {current_version} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    if current_version < CURRENT_VERSION {
        log::warn!(
            "Database needs migration from v{} to v{}",
            current_version,
            CURRENT_VERSION
        );
        perform_migration(&db, current_version)?;
        stamp_current(&db)?;
        db.flush()?;
        log::info!("Migration completed successfully");
    }

    Ok(())
}

/// Read the stored schema version
pub(crate) fn read_version(db: &DB) -> Result<Option<u32>> {
    match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let version_bytes: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| MemoryError::index("Invalid version format"))?;
            Ok(Some(u32::from_le_bytes(version_bytes)))
        }
        None => Ok(None),
    }
}

pub(crate) fn stamp_current(db: &DB) -> Result<()> {
    db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u64(db: &DB, key: &[u8]) -> Result<Option<u64>> {
    match db.get(key)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                MemoryError::index(format!(
                    "Invalid value under {}",
                    String::from_utf8_lossy(key)
                ))
            })?;
            Ok(Some(u64::from_le_bytes(raw)))
        }
        None => Ok(None),
    }
}

/// Perform migration from old version to current
fn perform_migration(db: &DB, from_version: u32) -> Result<()> {
    match from_version {
        1 => migrate_v1_to_v2(db),
        _ => Err(MemoryError::index(format!(
            "Unknown database version: {from_version}"
        ))),
    }
}

/// Migrate from v1 (JSON chunks) to v2 (bincode chunks with sequence numbers)
fn migrate_v1_to_v2(db: &DB) -> Result<()> {
    log::info!("Migrating database from v1 to v2...");

    let mut migrated = Vec::new();
    let mut skipped = 0usize;

    for item in db.iterator(IteratorMode::Start) {
        let (key, value) = item?;
        if !key.starts_with(CHUNK_PREFIX.as_bytes()) {
            continue;
        }

        // Already-converted records are kept as they are
        if bincode::deserialize::<StoredChunk>(&value).is_ok() {
            continue;
        }

        match serde_json::from_slice::<Chunk>(&value) {
            Ok(chunk) => migrated.push((key, chunk)),
            Err(e) => {
                log::error!(
                    "Failed to deserialize chunk {}: {}. Skipping.",
                    String::from_utf8_lossy(&key),
                    e
                );
                skipped += 1;
            }
        }
    }

    // Oldest first so recency ordering survives the upgrade
    migrated.sort_by_key(|(_, chunk)| chunk.created_at);

    let mut seq = read_u64(db, SEQ_KEY)?.unwrap_or(0);
    let mut batch = WriteBatch::default();
    let count = migrated.len();

    if read_u64(db, DIMENSION_KEY)?.is_none() {
        let dimension = migrated
            .iter()
            .find_map(|(_, chunk)| chunk.embedding.as_ref().map(Vec::len));
        if let Some(dimension) = dimension {
            batch.put(DIMENSION_KEY, (dimension as u64).to_le_bytes());
        }
    }

    for (key, chunk) in migrated {
        seq += 1;
        batch.put(key, bincode::serialize(&StoredChunk { chunk, seq })?);
    }
    batch.put(SEQ_KEY, seq.to_le_bytes());
    db.write(batch)?;

    log::info!("Migrated {} chunk(s), skipped {}", count, skipped);
    Ok(())
}
