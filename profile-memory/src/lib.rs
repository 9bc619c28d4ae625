//! Profile Memory
//!
//! Retrieval-augmented long-term memory for agents: a user's profile,
//! resumes and other documents are split into chunks, embedded, stored
//! per tenant and served back by semantic similarity.
//!
//! ## Features
//!
//! - **Recursive chunking** - Paragraph, line, sentence and word boundaries with exact overlap
//! - **Resilient embeddings** - Batching, bounded concurrency, timeouts and jittered retries over any provider
//! - **Tenant isolation** - Every index operation is scoped by owner
//! - **Atomic resync** - Insert-then-delete replacement of a document type
//! - **RocksDB persistence** - LZ4-compressed storage with schema migrations
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use profile_memory::{
//!     ChunkMetadata, DocumentType, HttpEmbeddingProvider, HttpProviderConfig, MemoryConfig,
//!     MemoryOrchestrator, RocksIndex,
//! };
//!
//! let provider = Arc::new(HttpEmbeddingProvider::new(HttpProviderConfig::from_env()?)?);
//! let index = Arc::new(RocksIndex::open(&data_dir)?);
//! let memory = MemoryOrchestrator::new(MemoryConfig::load(None)?, provider, index)?;
//!
//! memory.sync_user_profile("user-42", &profile_text).await?;
//! memory
//!     .add_document("user-42", &resume_text, ChunkMetadata::new(DocumentType::Resume, "upload"))
//!     .await?;
//!
//! let context = memory.query("user-42", "distributed systems experience", None).await?;
//! ```

pub mod chunk;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod migration;
pub mod orchestrator;
pub mod similarity;

// Re-exports for convenience
pub use chunk::{
    Chunk, ChunkBuilder, ChunkBuilderError, ChunkId, ChunkMetadata, DocumentType, MetadataFilter,
    MetadataValue, OwnerId,
};
pub use chunker::{split, TextSplitter};
pub use config::{ChunkingConfig, EmbeddingConfig, MemoryConfig, RetrievalConfig};
pub use embedding::{
    CachedEmbedder, EmbeddingError, EmbeddingProvider, HashingEmbedder, HttpEmbeddingProvider,
    HttpProviderConfig, ResilientEmbedder, RetryPolicy,
};
pub use error::{MemoryError, Result};
pub use index::{InMemoryIndex, RocksIndex, ScoredChunk, SearchParams, VectorIndex};
pub use orchestrator::{MemoryOrchestrator, OwnerStats, QueryOptions, SyncReport};
