use crate::error::ProviderError;
use crate::traits::{EmbeddingIntent, EmbeddingProvider};
use async_trait::async_trait;

pub const NGRAM_MODEL_ID: &str = "char-ngram-v1";

/// Offline embedder hashing character trigrams into a fixed number of
/// buckets. Deterministic, so re-runs produce identical vectors.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self { dimensions: 768 }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        NGRAM_MODEL_ID
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_texts(
        &self,
        texts: &[String],
        _intent: EmbeddingIntent,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}
