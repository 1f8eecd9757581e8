use crate::error::StoreError;
use crate::models::{CollectionInfo, DistanceMetric, MetadataFilter, SearchResult, VectorRecord};
use crate::traits::VectorBackend;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug)]
struct MemoryCollection {
    info: CollectionInfo,
    records: Vec<VectorRecord>,
    positions: HashMap<String, usize>,
}

/// Process-local backend. Used for tests and `VECTOR_STORE=memory` runs.
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(name: &str) -> StoreError {
    StoreError::InvalidArgument(format!("collection `{name}` does not exist"))
}

#[async_trait]
impl VectorBackend for MemoryVectorStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(name).map(|collection| collection.info.clone()))
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<CollectionInfo, StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            return Ok(existing.info.clone());
        }

        let info = CollectionInfo {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            dimension,
            metric,
        };
        collections.insert(
            name.to_string(),
            MemoryCollection {
                info: info.clone(),
                records: Vec::new(),
                positions: HashMap::new(),
            },
        );
        Ok(info)
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.write().await.remove(name);
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &CollectionInfo,
        records: &[VectorRecord],
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(&collection.name)
            .ok_or_else(|| missing(&collection.name))?;

        if let Some(bad) = records
            .iter()
            .find(|record| record.embedding.len() != target.info.dimension)
        {
            return Err(StoreError::SchemaConflict {
                collection: collection.name.clone(),
                expected: target.info.dimension,
                actual: bad.embedding.len(),
            });
        }

        for record in records {
            match target.positions.get(&record.id) {
                Some(&position) => target.records[position] = record.clone(),
                None => {
                    target.positions.insert(record.id.clone(), target.records.len());
                    target.records.push(record.clone());
                }
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &CollectionInfo,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchResult>, StoreError> {
        let collections = self.collections.read().await;
        let target = collections
            .get(&collection.name)
            .ok_or_else(|| missing(&collection.name))?;
        let metric = target.info.metric;

        let mut scored = target
            .records
            .iter()
            .filter(|record| filter.matches(&record.metadata))
            .map(|record| (metric.score(vector, &record.embedding), record))
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| {
            metric
                .rank_key(left.0)
                .partial_cmp(&metric.rank_key(right.0))
                .unwrap_or(Ordering::Equal)
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, record)| SearchResult {
                id: record.id.clone(),
                text: record.text.clone(),
                metadata: record.metadata.clone(),
                score,
            })
            .collect())
    }

    async fn count(&self, collection: &CollectionInfo) -> Result<u64, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&collection.name)
            .map(|target| target.records.len() as u64)
            .unwrap_or(0))
    }
}
