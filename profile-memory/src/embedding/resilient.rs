//! Batching, rate-capped, retrying embedding adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use rand::random;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::{EmbeddingError, EmbeddingProvider};
use crate::config::EmbeddingConfig;

/// Exponential backoff with jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Relative spread, 0.1 means +/-10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, never waits
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `attempt + 1` (zero-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64 / 1000.0) * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = (base * jitter_factor).max(0.0);
        if !jittered.is_finite() || jittered >= self.max_delay().as_secs_f64() {
            return self.max_delay();
        }
        Duration::from_secs_f64(jittered)
    }
}

/// The adapter the orchestrator embeds through
///
/// Splits input into batches of at most `max_batch_size`, keeps at most
/// `max_in_flight` provider calls running, bounds each call by
/// `call_timeout`, and retries transient failures per [`RetryPolicy`].
/// Fatal failures surface immediately; exhausted retries surface as
/// [`EmbeddingError::Exhausted`].
pub struct ResilientEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    permits: Semaphore,
    max_batch_size: usize,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl ResilientEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            inner,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            max_batch_size: config.max_batch_size.max(1),
            call_timeout: Duration::from_millis(config.call_timeout_ms.max(1)),
            retry: config.retry.clone(),
        }
    }

    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.call_once(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            let reason = match &err {
                EmbeddingError::Transient { reason, .. } => reason.clone(),
                other => other.to_string(),
            };

            if attempt >= max_attempts {
                log::warn!(
                    "Giving up on batch of {} after {} attempt(s): {}",
                    batch.len(),
                    attempt,
                    reason
                );
                return Err(EmbeddingError::Exhausted {
                    attempts: attempt,
                    reason,
                });
            }

            let backoff = self.retry.delay_for_attempt(attempt - 1);
            // Retry-After may lengthen the wait but never past the cap
            let delay = err
                .retry_after()
                .map_or(backoff, |wait| wait.max(backoff))
                .min(self.retry.max_delay());
            log::warn!(
                "Embedding attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                max_attempts,
                reason,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn call_once(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbeddingError::fatal("embedding limiter closed"))?;

        let vectors = tokio::time::timeout(self.call_timeout, self.inner.embed_batch(batch))
            .await
            .map_err(|_| {
                EmbeddingError::transient(format!(
                    "embedding call timed out after {:?}",
                    self.call_timeout
                ))
            })??;

        if vectors.len() != batch.len() {
            return Err(EmbeddingError::fatal(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }

        let expected = self.inner.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(EmbeddingError::fatal(format!(
                "provider returned a {}-dimensional vector, expected {}",
                bad.len(),
                expected
            )));
        }

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for ResilientEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches = texts.chunks(self.max_batch_size);
        log::debug!(
            "Embedding {} text(s) in {} batch(es)",
            texts.len(),
            batches.len()
        );

        let results = try_join_all(batches.map(|batch| self.embed_with_retry(batch))).await?;
        Ok(results.into_iter().flatten().collect())
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Instant;

    const DIM: usize = 8;

    enum Behaviour {
        /// Fail transiently this many times, then succeed
        FailTimes(u32, Option<Duration>),
        Fatal,
        Sleep(Duration),
        WrongDimension,
    }

    struct FakeProvider {
        behaviour: Behaviour,
        calls: AtomicU32,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        real: HashingEmbedder,
    }

    impl FakeProvider {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                real: HashingEmbedder::new(DIM),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = match &self.behaviour {
                Behaviour::FailTimes(n, retry_after) if call < *n => Err(EmbeddingError::Transient {
                    reason: "503 Service Unavailable".into(),
                    retry_after: *retry_after,
                }),
                Behaviour::FailTimes(..) => self.real.embed_batch(texts).await,
                Behaviour::Fatal => Err(EmbeddingError::fatal("401 Unauthorized")),
                Behaviour::Sleep(d) => {
                    tokio::time::sleep(*d).await;
                    self.real.embed_batch(texts).await
                }
                Behaviour::WrongDimension => Ok(texts.iter().map(|_| vec![0.5; DIM + 1]).collect()),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn model_name(&self) -> &str {
            "fake"
        }

        fn dimension(&self) -> usize {
            DIM
        }
    }

    fn config(max_batch_size: usize, max_in_flight: usize, max_attempts: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            max_batch_size,
            max_in_flight,
            call_timeout_ms: 1_000,
            cache_capacity: 0,
            retry: RetryPolicy {
                max_attempts,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text number {i}")).collect()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            jitter: 0.1,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(0).as_secs_f64();
            assert!((0.9..=1.1).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = FakeProvider::new(Behaviour::FailTimes(2, None));
        let embedder = ResilientEmbedder::new(provider.clone(), &config(16, 4, 4));

        let vectors = embedder.embed_batch(&texts(3)).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let provider = FakeProvider::new(Behaviour::FailTimes(u32::MAX, None));
        let embedder = ResilientEmbedder::new(provider.clone(), &config(16, 4, 3));

        match embedder.embed_one("hello").await {
            Err(EmbeddingError::Exhausted { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("503"));
            }
            other => panic!("Expected Exhausted, got {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let provider = FakeProvider::new(Behaviour::Fatal);
        let embedder = ResilientEmbedder::new(provider.clone(), &config(16, 4, 5));

        let err = embedder.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Fatal(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let provider = FakeProvider::new(Behaviour::FailTimes(0, None));
        let embedder = ResilientEmbedder::new(provider.clone(), &config(3, 2, 1));
        let input = texts(10);

        let vectors = embedder.embed_batch(&input).await.unwrap();
        let expected: Vec<Vec<f32>> = input
            .iter()
            .map(|t| HashingEmbedder::new(DIM).embed_text(t))
            .collect();

        assert_eq!(vectors, expected);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_in_flight_is_capped() {
        let provider = FakeProvider::new(Behaviour::Sleep(Duration::from_millis(20)));
        let embedder = ResilientEmbedder::new(provider.clone(), &config(1, 2, 1));

        embedder.embed_batch(&texts(8)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 8);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient() {
        let provider = FakeProvider::new(Behaviour::Sleep(Duration::from_millis(500)));
        let mut cfg = config(16, 4, 2);
        cfg.call_timeout_ms = 20;
        let embedder = ResilientEmbedder::new(provider.clone(), &cfg);

        let err = embedder.embed_one("slow").await.unwrap_err();
        match err {
            EmbeddingError::Exhausted { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("timed out"));
            }
            other => panic!("Expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_is_honoured() {
        let wait = Duration::from_millis(60);
        let provider = FakeProvider::new(Behaviour::FailTimes(1, Some(wait)));
        let mut cfg = config(16, 4, 2);
        cfg.retry.max_delay_ms = 1_000;
        let embedder = ResilientEmbedder::new(provider.clone(), &cfg);

        let start = Instant::now();
        embedder.embed_one("hello").await.unwrap();
        assert!(start.elapsed() >= wait);
    }

    #[tokio::test]
    async fn test_retry_after_is_capped_by_max_delay() {
        let provider = FakeProvider::new(Behaviour::FailTimes(
            1,
            Some(Duration::from_secs(86_400)),
        ));
        let embedder = ResilientEmbedder::new(provider.clone(), &config(16, 4, 2));

        let result = tokio::time::timeout(Duration::from_secs(5), embedder.embed_one("hello"))
            .await
            .expect("retry wait should be capped at max_delay");
        assert!(result.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_fatal() {
        let provider = FakeProvider::new(Behaviour::WrongDimension);
        let embedder = ResilientEmbedder::new(provider.clone(), &config(16, 4, 3));

        let err = embedder.embed_one("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Fatal(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let provider = FakeProvider::new(Behaviour::Fatal);
        let embedder = ResilientEmbedder::new(provider.clone(), &config(16, 4, 3));
        assert!(embedder.embed_batch(&[]).await.unwrap().is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
