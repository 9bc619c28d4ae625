//! Embedding module
//!
//! The [`EmbeddingProvider`] capability plus the adapters layered on top of
//! it: an HTTP client for OpenAI-compatible services, a deterministic local
//! embedder, an LRU cache, and the retrying, rate-capped
//! [`ResilientEmbedder`] the orchestrator talks to.

mod cache;
mod hashing;
mod http;
mod resilient;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::CachedEmbedder;
pub use hashing::HashingEmbedder;
pub use http::{HttpEmbeddingProvider, HttpProviderConfig};
pub use resilient::{ResilientEmbedder, RetryPolicy};

/// Embedding failures, split by whether retrying can help
#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    /// Timeout, rate limit, server-side failure
    #[error("transient embedding failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Bad credentials, invalid input, malformed response
    #[error("embedding request rejected: {0}")]
    Fatal(String),

    /// Transient failures outlasted the retry budget
    #[error("embedding failed after {attempts} attempt(s): {reason}")]
    Exhausted { attempts: u32, reason: String },
}

impl EmbeddingError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Server-requested wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Converts text into fixed-dimension vectors
///
/// Output order matches input order and every vector has
/// [`dimension`](EmbeddingProvider::dimension) entries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::fatal("empty embedding response"))
    }

    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;
}
