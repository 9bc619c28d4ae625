//! Deterministic offline embeddings
//!
//! Feature hashing over lower-cased words and character trigrams, L2
//! normalised. No network, no model files; identical texts always map to
//! identical vectors, and texts sharing vocabulary land close together.

use async_trait::async_trait;

use super::{EmbeddingError, EmbeddingProvider};

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

/// Local feature-hashing embedder
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 256;

    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model: format!("hashing-{dimension}"),
        }
    }

    /// Embed a single text synchronously
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let lower = text.to_lowercase();

        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, b"w:", word, WORD_WEIGHT);
        }

        let chars: Vec<char> = lower.chars().collect();
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            self.add_feature(&mut vector, b"t:", &trigram, TRIGRAM_WEIGHT);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], prefix: &[u8], feature: &str, weight: f32) {
        let hash = fnv1a(prefix, feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        // one high bit picks the sign so collisions cancel instead of pile up
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

fn fnv1a(prefix: &[u8], bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    prefix
        .iter()
        .chain(bytes)
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
