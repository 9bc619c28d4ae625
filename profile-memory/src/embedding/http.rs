//! OpenAI-compatible embeddings over HTTP
//!
//! Talks to `POST {base}/v1/embeddings` and classifies failures into
//! transient (worth retrying) and fatal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};
use crate::error::{MemoryError, Result};

const MAX_ERROR_BODY: usize = 512;

/// Connection settings for [`HttpEmbeddingProvider`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<SecretString>,
    pub timeout_ms: u64,
    /// Send `dimensions` in the request (models with shortenable output)
    pub send_dimensions: bool,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            api_key: None,
            timeout_ms: 30_000,
            send_dimensions: false,
        }
    }
}

impl HttpProviderConfig {
    /// Defaults overridden by `EMBEDDING_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = get("EMBEDDING_BASE_URL") {
            config.base_url = url;
        }
        if let Some(model) = get("EMBEDDING_MODEL") {
            config.model = model;
        }
        if let Some(dim) = get("EMBEDDING_DIMENSION") {
            config.dimension = parse_var("EMBEDDING_DIMENSION", &dim)?;
        }
        if let Some(timeout) = get("EMBEDDING_TIMEOUT_MS") {
            config.timeout_ms = parse_var("EMBEDDING_TIMEOUT_MS", &timeout)?;
        }
        config.api_key = get("EMBEDDING_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::new);

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MemoryError::validation(format!("{name} is not a valid number: {value:?}")))
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

/// Accepts host-only bases, `/vN` bases and full `/embeddings` URLs
fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/embeddings") {
        return normalized;
    }
    if has_version_suffix(&normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedding provider for OpenAI-compatible services
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    dimension: usize,
    send_dimensions: bool,
}

impl HttpEmbeddingProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(MemoryError::validation("embedding model name is empty"));
        }
        if config.dimension == 0 {
            return Err(MemoryError::validation("embedding dimension must be positive"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|e| MemoryError::validation(format!("failed to build HTTP client: {e}")))?;

        let endpoint = embeddings_endpoint(&config.base_url);
        log::info!(
            "HTTP embedding provider: {} ({}d) at {}",
            config.model,
            config.dimension,
            endpoint
        );

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            model: config.model,
            dimension: config.dimension,
            send_dimensions: config.send_dimensions,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_send_error(err: reqwest::Error) -> EmbeddingError {
    if err.is_builder() {
        EmbeddingError::fatal(format!("invalid embedding request: {err}"))
    } else {
        // timeouts, refused connections, resets
        EmbeddingError::transient(format!("embedding request failed: {err}"))
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.send_dimensions.then_some(self.dimension),
        };

        let mut request = self.client.post(&self.endpoint).json(&req);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbeddingError::Transient {
                reason: "rate limited (HTTP 429)".to_string(),
                retry_after: retry_after(response.headers()),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {}: {}", status, truncate(&body));
            return if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
                Err(EmbeddingError::transient(reason))
            } else {
                Err(EmbeddingError::fatal(reason))
            };
        }

        let body = response.bytes().await.map_err(classify_send_error)?;
        let mut parsed: EmbeddingResponse = serde_json::from_slice(&body)
            .map_err(|e| EmbeddingError::fatal(format!("malformed embedding response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::fatal(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        if parsed.data.iter().enumerate().any(|(i, d)| d.index != i) {
            return Err(EmbeddingError::fatal(
                "embedding response indices do not cover the input",
            ));
        }

        log::debug!("Embedded batch of {} via {}", texts.len(), self.model);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
