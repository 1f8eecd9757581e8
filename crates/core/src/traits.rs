use crate::error::{IngestError, ProviderError, StoreError};
use crate::models::{
    CollectionInfo, DistanceMetric, MetadataFilter, ParserKind, SearchResult, VectorRecord,
};
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// One way of turning a file into page texts.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    fn kind(&self) -> ParserKind;

    /// Cheap pre-check; a strategy that declines is skipped without counting
    /// as a failure.
    fn accepts(&self, _path: &Path) -> bool {
        true
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

/// Whether a text is embedded for storage or for lookup. Some models encode
/// the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingIntent {
    Document,
    Query,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One request to the provider. Returns one vector per input, in order.
    async fn embed_texts(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// The persistent collection store.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError>;

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<CollectionInfo, StoreError>;

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Writes records keyed by id. Every record is written entirely or not at
    /// all, and concurrent writers to the same id must not interleave.
    async fn upsert(
        &self,
        collection: &CollectionInfo,
        records: &[VectorRecord],
    ) -> Result<(), StoreError>;

    /// Best-first, ties in insertion order.
    async fn query(
        &self,
        collection: &CollectionInfo,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchResult>, StoreError>;

    async fn count(&self, collection: &CollectionInfo) -> Result<u64, StoreError>;
}
