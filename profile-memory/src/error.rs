//! Error types for profile-memory

use thiserror::Error;

use crate::embedding::EmbeddingError;

/// Errors that can occur in the memory system
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Input rejected before any work was done (empty content, bad owner, bad config)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding provider kept failing transiently past the retry budget
    #[error("Embedding unavailable after {attempts} attempt(s): {reason}")]
    EmbeddingUnavailable { attempts: u32, reason: String },

    /// Embedding provider rejected the request permanently
    #[error("Embedding provider error: {0}")]
    ProviderFatal(String),

    /// Storage engine unreachable or rejected the operation
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// Vector dimension differs from the one the index was created with
    #[error("Dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Record serialization error (bincode)
    #[error("Serialization error: {0}")]
    Codec(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an index error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::IndexUnavailable(msg.into())
    }

    /// True for failures that come from the embedding provider
    pub fn is_embedding_failure(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. } | Self::ProviderFatal(_)
        )
    }

    /// True when retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. } | Self::IndexUnavailable(_)
        )
    }
}

impl From<rocksdb::Error> for MemoryError {
    fn from(err: rocksdb::Error) -> Self {
        Self::IndexUnavailable(err.to_string())
    }
}

impl From<EmbeddingError> for MemoryError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Transient { reason, .. } => Self::EmbeddingUnavailable {
                attempts: 1,
                reason,
            },
            EmbeddingError::Exhausted { attempts, reason } => {
                Self::EmbeddingUnavailable { attempts, reason }
            }
            EmbeddingError::Fatal(reason) => Self::ProviderFatal(reason),
        }
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;
