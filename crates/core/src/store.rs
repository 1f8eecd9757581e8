use crate::config::StoreConfig;
use crate::embeddings::EmbeddingService;
use crate::error::StoreError;
use crate::models::{
    metadata_object, Chunk, CollectionInfo, CollectionState, CollectionStats, DistanceMetric,
    EmbeddingVector, MetadataFilter, SearchInput, SearchResult, VectorRecord,
};
use crate::retry::RetryPolicy;
use crate::traits::VectorBackend;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Owns the persistent collection: lazy creation, schema checks, retried
/// writes and the query path.
pub struct VectorStoreManager {
    backend: Arc<dyn VectorBackend>,
    embeddings: Arc<EmbeddingService>,
    collection_name: String,
    metric: DistanceMetric,
    retry: RetryPolicy,
    known: Mutex<HashMap<String, CollectionInfo>>,
}

impl VectorStoreManager {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embeddings: Arc<EmbeddingService>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            backend,
            embeddings,
            collection_name: config.collection_name.clone(),
            metric: config.metric,
            retry: RetryPolicy::new(config.max_attempts, config.initial_backoff, config.max_backoff),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn retried<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.retry
            .run(label, operation, StoreError::is_transient)
            .await
            .map_err(|failure| failure.error)
    }

    async fn lookup(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let backend = &self.backend;
        self.retried("collection lookup", move || backend.collection(name))
            .await
    }

    /// Creates the collection if absent. An existing collection with another
    /// dimension is a `SchemaConflict`; it is never migrated.
    pub async fn ensure_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<CollectionInfo, StoreError> {
        if dimension == 0 {
            return Err(StoreError::InvalidArgument(
                "collection dimension must be positive".to_string(),
            ));
        }

        let mut known = self.known.lock().await;
        let info = match known.get(name) {
            Some(info) => info.clone(),
            None => match self.lookup(name).await? {
                Some(existing) => existing,
                None => {
                    let backend = &self.backend;
                    let created = self
                        .retried("create collection", move || {
                            backend.create_collection(name, dimension, metric)
                        })
                        .await?;
                    info!(collection = name, dimension, %metric, "collection ready");
                    created
                }
            },
        };

        if info.dimension != dimension {
            return Err(StoreError::SchemaConflict {
                collection: name.to_string(),
                expected: info.dimension,
                actual: dimension,
            });
        }

        if info.metric != metric {
            warn!(
                collection = name,
                existing = %info.metric,
                requested = %metric,
                "keeping existing collection metric"
            );
        }

        known.insert(name.to_string(), info.clone());
        Ok(info)
    }

    /// Idempotent write keyed by chunk id. Returns the number of records
    /// written.
    pub async fn upsert(
        &self,
        name: &str,
        items: &[(Chunk, EmbeddingVector)],
    ) -> Result<usize, StoreError> {
        let Some((_, first)) = items.first() else {
            return Ok(0);
        };

        let mut records = Vec::with_capacity(items.len());
        for (chunk, vector) in items {
            if chunk.id != vector.chunk_id {
                return Err(StoreError::InvalidArgument(format!(
                    "vector for {} paired with chunk {}",
                    vector.chunk_id, chunk.id
                )));
            }
            records.push(VectorRecord {
                id: chunk.id.clone(),
                text: chunk.text.clone(),
                metadata: metadata_object(&chunk.metadata)?,
                embedding: vector.values.clone(),
                model: vector.model.clone(),
            });
        }

        let info = self
            .ensure_collection(name, first.dimension(), self.metric)
            .await?;
        let backend = &self.backend;
        let (info_ref, records_ref) = (&info, records.as_slice());
        self.retried("upsert", move || backend.upsert(info_ref, records_ref))
            .await?;

        debug!(collection = name, records = records.len(), "records upserted");
        Ok(records.len())
    }

    /// Top-`k` records, best first. An absent collection yields no results.
    pub async fn similarity_search(
        &self,
        name: &str,
        input: SearchInput,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchResult>, StoreError> {
        if k == 0 {
            return Err(StoreError::InvalidArgument("k must be at least 1".to_string()));
        }

        let vector = match input {
            SearchInput::Text(text) => self.embeddings.embed_query(&text).await?,
            SearchInput::Vector(vector) => vector,
        };

        let Some(info) = self.lookup(name).await? else {
            return Ok(Vec::new());
        };
        if vector.len() != info.dimension {
            return Err(StoreError::SchemaConflict {
                collection: name.to_string(),
                expected: info.dimension,
                actual: vector.len(),
            });
        }

        let backend = &self.backend;
        let (info_ref, vector_ref) = (&info, vector.as_slice());
        self.retried("similarity search", move || {
            backend.query(info_ref, vector_ref, k, filter)
        })
        .await
    }

    /// Drops and recreates the collection with its previous schema, or with
    /// the configured one when it did not exist.
    pub async fn reset(&self, name: &str) -> Result<CollectionInfo, StoreError> {
        let mut known = self.known.lock().await;
        known.remove(name);

        let (dimension, metric) = match self.lookup(name).await? {
            Some(existing) => {
                let backend = &self.backend;
                self.retried("drop collection", move || backend.drop_collection(name))
                    .await?;
                (existing.dimension, existing.metric)
            }
            None => (self.embeddings.dimension(), self.metric),
        };

        let backend = &self.backend;
        let info = self
            .retried("create collection", move || {
                backend.create_collection(name, dimension, metric)
            })
            .await?;
        info!(collection = name, dimension, %metric, "collection reset");
        known.insert(name.to_string(), info.clone());
        Ok(info)
    }

    pub async fn stats(&self, name: &str) -> Result<CollectionStats, StoreError> {
        let Some(info) = self.lookup(name).await? else {
            return Ok(CollectionStats {
                name: name.to_string(),
                state: CollectionState::Absent,
                record_count: 0,
                dimension: None,
                metric: None,
            });
        };

        let backend = &self.backend;
        let info_ref = &info;
        let record_count = self
            .retried("count", move || backend.count(info_ref))
            .await?;

        Ok(CollectionStats {
            name: name.to_string(),
            state: if record_count == 0 {
                CollectionState::Created
            } else {
                CollectionState::Populated
            },
            record_count,
            dimension: Some(info.dimension),
            metric: Some(info.metric),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::models::{ChunkMetadata, DocumentFormat};
    use crate::providers::CharacterNgramEmbedder;
    use crate::stores::MemoryVectorStore;
    use std::collections::BTreeMap;

    const DIMENSION: usize = 16;

    fn manager() -> VectorStoreManager {
        let embeddings = EmbeddingService::new(
            Arc::new(CharacterNgramEmbedder::new(DIMENSION)),
            &EmbeddingConfig::default(),
        )
        .expect("service builds");
        VectorStoreManager::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(embeddings),
            &StoreConfig::default(),
        )
    }

    fn chunk(id: &str, text: &str, source: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                document_id: format!("doc-{source}"),
                source_file: source.to_string(),
                file_path: format!("/data/{source}"),
                format: DocumentFormat::Text,
                page: None,
                chunk_ordinal: 0,
                start_char: 0,
                end_char: text.chars().count(),
                overlap_chars: 0,
                extra: BTreeMap::new(),
            },
        }
    }

    fn pair(id: &str, text: &str, source: &str) -> (Chunk, EmbeddingVector) {
        (
            chunk(id, text, source),
            EmbeddingVector {
                chunk_id: id.to_string(),
                values: CharacterNgramEmbedder::new(DIMENSION).embed(text),
                model: "char-ngram-v1".to_string(),
            },
        )
    }

    async fn seeded() -> Result<VectorStoreManager, StoreError> {
        let manager = manager();
        manager
            .upsert(
                "docs",
                &[
                    pair("a", "addition within ten", "x.txt"),
                    pair("b", "subtraction within twenty", "y.txt"),
                    pair("c", "addition and subtraction practice", "y.txt"),
                ],
            )
            .await?;
        Ok(manager)
    }

    #[tokio::test]
    async fn results_are_best_first_and_k_is_clamped() -> Result<(), StoreError> {
        let manager = seeded().await?;

        let hits = manager
            .similarity_search("docs", "addition within ten".into(), 10, &MetadataFilter::new())
            .await?;
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].id, "a");
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
        Ok(())
    }

    #[tokio::test]
    async fn filter_excludes_better_ranked_records() -> Result<(), StoreError> {
        let manager = seeded().await?;
        let filter = MetadataFilter::new().equals("source_file", "y.txt");

        let hits = manager
            .similarity_search("docs", "addition within ten".into(), 5, &filter)
            .await?;
        assert_eq!(hits.len(), 2);
        assert!(hits
            .iter()
            .all(|hit| hit.metadata["source_file"] == serde_json::json!("y.txt")));
        Ok(())
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() -> Result<(), StoreError> {
        let manager = manager();
        let same = CharacterNgramEmbedder::new(DIMENSION).embed("same");
        let items = ["first", "second", "third"]
            .iter()
            .map(|id| {
                (
                    chunk(id, "same", "x.txt"),
                    EmbeddingVector {
                        chunk_id: id.to_string(),
                        values: same.clone(),
                        model: "m".to_string(),
                    },
                )
            })
            .collect::<Vec<_>>();
        manager.upsert("docs", &items).await?;

        let hits = manager
            .similarity_search("docs", SearchInput::Vector(same), 3, &MetadataFilter::new())
            .await?;
        let ids = hits.iter().map(|hit| hit.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["first", "second", "third"]);
        Ok(())
    }

    #[tokio::test]
    async fn reupserting_overwrites() -> Result<(), StoreError> {
        let manager = seeded().await?;
        manager
            .upsert("docs", &[pair("a", "addition within ten, revised", "x.txt")])
            .await?;

        let stats = manager.stats("docs").await?;
        assert_eq!(stats.record_count, 3);
        assert_eq!(stats.state, CollectionState::Populated);
        assert_eq!(stats.dimension, Some(DIMENSION));
        Ok(())
    }

    #[tokio::test]
    async fn reset_then_stats_reports_zero() -> Result<(), StoreError> {
        let manager = seeded().await?;
        let info = manager.reset("docs").await?;
        assert_eq!(info.dimension, DIMENSION);

        let stats = manager.stats("docs").await?;
        assert_eq!(stats.record_count, 0);
        assert_eq!(stats.state, CollectionState::Created);
        Ok(())
    }

    #[tokio::test]
    async fn absent_collection_reports_absent() -> Result<(), StoreError> {
        let manager = manager();
        let stats = manager.stats("nothing").await?;
        assert_eq!(stats.state, CollectionState::Absent);
        assert!(manager
            .similarity_search("nothing", "query".into(), 1, &MetadataFilter::new())
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_dimension_is_a_schema_conflict() -> Result<(), StoreError> {
        let manager = seeded().await?;
        let result = manager
            .ensure_collection("docs", DIMENSION + 1, DistanceMetric::Cosine)
            .await;
        assert!(matches!(result, Err(StoreError::SchemaConflict { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn zero_k_is_rejected() -> Result<(), StoreError> {
        let manager = seeded().await?;
        let result = manager
            .similarity_search("docs", "query".into(), 0, &MetadataFilter::new())
            .await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        Ok(())
    }

    /// Memory backend whose writes drop the connection a fixed number of times.
    struct DroppingBackend {
        inner: MemoryVectorStore,
        failures_left: std::sync::atomic::AtomicUsize,
        upsert_calls: std::sync::atomic::AtomicUsize,
    }

    impl DroppingBackend {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryVectorStore::new(),
                failures_left: std::sync::atomic::AtomicUsize::new(failures),
                upsert_calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn upsert_calls(&self) -> usize {
            self.upsert_calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl VectorBackend for DroppingBackend {
        fn name(&self) -> &'static str {
            "dropping"
        }

        async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
            self.inner.collection(name).await
        }

        async fn create_collection(
            &self,
            name: &str,
            dimension: usize,
            metric: DistanceMetric,
        ) -> Result<CollectionInfo, StoreError> {
            self.inner.create_collection(name, dimension, metric).await
        }

        async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
            self.inner.drop_collection(name).await
        }

        async fn upsert(
            &self,
            collection: &CollectionInfo,
            records: &[VectorRecord],
        ) -> Result<(), StoreError> {
            use std::sync::atomic::Ordering;
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            let dropped = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if dropped {
                return Err(StoreError::Connection("connection reset by peer".to_string()));
            }
            self.inner.upsert(collection, records).await
        }

        async fn query(
            &self,
            collection: &CollectionInfo,
            vector: &[f32],
            k: usize,
            filter: &MetadataFilter,
        ) -> Result<Vec<SearchResult>, StoreError> {
            self.inner.query(collection, vector, k, filter).await
        }

        async fn count(&self, collection: &CollectionInfo) -> Result<u64, StoreError> {
            self.inner.count(collection).await
        }
    }

    fn manager_over(backend: Arc<DroppingBackend>, max_attempts: u32) -> VectorStoreManager {
        let embeddings = EmbeddingService::new(
            Arc::new(CharacterNgramEmbedder::new(DIMENSION)),
            &EmbeddingConfig::default(),
        )
        .expect("service builds");
        let config = StoreConfig {
            max_attempts,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            ..StoreConfig::default()
        };
        VectorStoreManager::new(backend, Arc::new(embeddings), &config)
    }

    #[tokio::test]
    async fn dropped_connections_are_retried_until_the_write_lands() -> Result<(), StoreError> {
        let backend = Arc::new(DroppingBackend::new(2));
        let manager = manager_over(backend.clone(), 4);

        let written = manager
            .upsert("docs", &[pair("a", "addition within ten", "x.txt")])
            .await?;

        assert_eq!(written, 1);
        assert_eq!(backend.upsert_calls(), 3);
        assert_eq!(manager.stats("docs").await?.record_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn connection_errors_surface_once_attempts_run_out() -> Result<(), StoreError> {
        let backend = Arc::new(DroppingBackend::new(10));
        let manager = manager_over(backend.clone(), 3);

        let result = manager
            .upsert("docs", &[pair("a", "addition within ten", "x.txt")])
            .await;

        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert_eq!(backend.upsert_calls(), 3);
        assert_eq!(manager.stats("docs").await?.record_count, 0);
        Ok(())
    }
}
