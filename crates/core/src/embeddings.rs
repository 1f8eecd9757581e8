use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, ProviderError};
use crate::models::{Chunk, EmbeddingVector};
use crate::retry::RetryPolicy;
use crate::traits::{EmbeddingIntent, EmbeddingProvider};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// Batches chunk texts through an [`EmbeddingProvider`], retrying transient
/// provider failures with backoff.
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
    document_prefix: String,
    query_prefix: String,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
    ) -> Result<Self, EmbeddingError> {
        if config.batch_size == 0 {
            return Err(EmbeddingError::InvalidInput(
                "batch size must be positive".to_string(),
            ));
        }
        if provider.dimensions() == 0 {
            return Err(EmbeddingError::InvalidInput(
                "provider reports a zero dimension".to_string(),
            ));
        }

        Ok(Self {
            provider,
            batch_size: config.batch_size,
            concurrency: config.max_concurrency.max(1),
            retry: RetryPolicy::new(
                config.max_attempts,
                config.initial_backoff,
                config.max_backoff,
            ),
            document_prefix: config.document_prefix.clone(),
            query_prefix: config.query_prefix.clone(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embeds one batch with a single provider call per attempt. Output is
    /// aligned with `chunks`.
    pub async fn embed_batch(
        &self,
        batch_index: usize,
        chunks: &[Chunk],
    ) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(empty) = chunks.iter().find(|chunk| chunk.text.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(format!(
                "chunk {} has no text",
                empty.id
            )));
        }

        let texts = chunks
            .iter()
            .map(|chunk| format!("{}{}", self.document_prefix, chunk.text))
            .collect::<Vec<_>>();
        let vectors = self
            .call_provider(batch_index, &texts, EmbeddingIntent::Document)
            .await?;

        if vectors.len() != chunks.len() {
            return Err(EmbeddingError::Failed {
                batch: batch_index,
                attempts: 1,
                reason: format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    chunks.len()
                ),
            });
        }

        let model = self.provider.model_id().to_string();
        debug!(batch = batch_index, size = chunks.len(), "batch embedded");
        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, values)| EmbeddingVector {
                chunk_id: chunk.id.clone(),
                values,
                model: model.clone(),
            })
            .collect())
    }

    /// All chunks, `batch_size` at a time, with at most `concurrency` requests
    /// in flight. Results keep input order.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        let results = stream::iter(chunks.chunks(self.batch_size).enumerate())
            .map(|(index, batch)| self.embed_batch(index, batch))
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut vectors = Vec::with_capacity(chunks.len());
        for result in results {
            vectors.extend(result?);
        }
        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("query text is empty".to_string()));
        }

        let texts = vec![format!("{}{}", self.query_prefix, text)];
        self.call_provider(0, &texts, EmbeddingIntent::Query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Failed {
                batch: 0,
                attempts: 1,
                reason: "provider returned no vector for the query".to_string(),
            })
    }

    async fn call_provider(
        &self,
        batch_index: usize,
        texts: &[String],
        intent: EmbeddingIntent,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let provider = &self.provider;
        let vectors = self
            .retry
            .run(
                "embed",
                move || provider.embed_texts(texts, intent),
                ProviderError::is_transient,
            )
            .await
            .map_err(|failure| match failure.error {
                ProviderError::Permanent(reason) => EmbeddingError::ProviderFatal(reason),
                ProviderError::Transient(reason) => EmbeddingError::Failed {
                    batch: batch_index,
                    attempts: failure.attempts,
                    reason,
                },
            })?;

        let expected = self.provider.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(EmbeddingError::ProviderFatal(format!(
                "model {} returned {}-dimensional vectors, expected {expected}",
                self.provider.model_id(),
                bad.len()
            )));
        }

        Ok(vectors)
    }
}
