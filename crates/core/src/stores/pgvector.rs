//! Postgres + pgvector backend.
//!
//! Two tables hold every collection: `ingest_collections` records the name,
//! dimension and metric of each collection, and `ingest_records` holds one
//! row per chunk keyed by `(collection_id, id)`. The embedding column is an
//! untyped `vector` so collections of different dimensions can share it;
//! queries cast to the collection's dimension, which also lets a partial HNSW
//! index per collection be used.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{CollectionInfo, DistanceMetric, FilterCondition, MetadataFilter, SearchResult, VectorRecord};
use crate::traits::VectorBackend;
use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const BOOTSTRAP: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS ingest_collections (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        dimension INTEGER NOT NULL,
        metric TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS ingest_records (
        collection_id UUID NOT NULL REFERENCES ingest_collections (id) ON DELETE CASCADE,
        id TEXT NOT NULL,
        document TEXT NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        embedding vector NOT NULL,
        model TEXT NOT NULL,
        seq BIGSERIAL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (collection_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS ingest_records_metadata_idx
        ON ingest_records USING GIN (metadata)",
];

const UPSERT: &str = "INSERT INTO ingest_records (collection_id, id, document, metadata, embedding, model)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (collection_id, id) DO UPDATE SET
        document = EXCLUDED.document,
        metadata = EXCLUDED.metadata,
        embedding = EXCLUDED.embedding,
        model = EXCLUDED.model,
        updated_at = now()";

pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects with either the full connection string or the individual
    /// host settings, then creates the schema if needed.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = match config.normalized_connection_string() {
            Some(url) => PgConnectOptions::from_str(&url).map_err(|error| {
                StoreError::InvalidArgument(format!("invalid postgres connection string: {error}"))
            })?,
            None => {
                let mut options = PgConnectOptions::new()
                    .host(&config.host)
                    .port(config.port)
                    .database(&config.database)
                    .username(&config.user);
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                options
            }
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.bootstrap().await?;
        Ok(store)
    }

    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        if let Err(error) = sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await
        {
            warn!(%error, "could not create the vector extension, assuming it is installed");
        }

        for statement in BOOTSTRAP {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn create_hnsw_index(&self, id: Uuid, dimension: usize, metric: DistanceMetric) {
        let statement = format!(
            "CREATE INDEX IF NOT EXISTS {} ON ingest_records USING hnsw ((embedding::vector({dimension})) {}) WHERE collection_id = '{id}'",
            index_name(id),
            operator_class(metric),
        );
        match sqlx::query(&statement).execute(&self.pool).await {
            Ok(_) => info!(collection = %id, "hnsw index ready"),
            Err(error) => warn!(collection = %id, %error, "hnsw index not created, queries fall back to a scan"),
        }
    }
}

fn collection_uuid(collection: &CollectionInfo) -> Result<Uuid, StoreError> {
    Uuid::parse_str(&collection.id).map_err(|error| {
        StoreError::InvalidArgument(format!("collection id {} is not a uuid: {error}", collection.id))
    })
}

fn index_name(id: Uuid) -> String {
    format!("ingest_records_hnsw_{}", id.simple())
}

fn distance_operator(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "<=>",
        DistanceMetric::Euclidean => "<->",
        DistanceMetric::InnerProduct => "<#>",
    }
}

fn operator_class(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Cosine => "vector_cosine_ops",
        DistanceMetric::Euclidean => "vector_l2_ops",
        DistanceMetric::InnerProduct => "vector_ip_ops",
    }
}

/// pgvector returns distances; callers get the metric's natural score.
fn distance_to_score(metric: DistanceMetric, distance: f64) -> f64 {
    match metric {
        DistanceMetric::Cosine => 1.0 - distance,
        DistanceMetric::Euclidean => distance,
        DistanceMetric::InnerProduct => -distance,
    }
}

fn search_query<'a>(
    collection_id: Uuid,
    dimension: usize,
    metric: DistanceMetric,
    vector: &[f32],
    k: usize,
    filter: &'a MetadataFilter,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT id, document, metadata, (embedding::vector({dimension}) {} ",
        distance_operator(metric)
    ));
    builder.push_bind(Vector::from(vector.to_vec()));
    builder.push(") AS distance FROM ingest_records WHERE collection_id = ");
    builder.push_bind(collection_id);

    for (field, condition) in &filter.conditions {
        builder.push(" AND metadata -> ");
        builder.push_bind(field.as_str());
        match condition {
            FilterCondition::Equals(value) => {
                builder.push(" = ");
                builder.push_bind(Json(value));
            }
            FilterCondition::Contains(value) => {
                builder.push(" @> ");
                builder.push_bind(Json(value));
            }
        }
    }

    builder.push(" ORDER BY distance, seq LIMIT ");
    builder.push_bind(i64::try_from(k).unwrap_or(i64::MAX));
    builder
}

#[async_trait]
impl VectorBackend for PgVectorStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let row = sqlx::query("SELECT id, dimension, metric FROM ingest_collections WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        let dimension: i32 = row.try_get("dimension")?;
        let metric: String = row.try_get("metric")?;
        let metric = DistanceMetric::parse(&metric).ok_or_else(|| StoreError::Backend {
            backend: "postgres".to_string(),
            details: format!("collection `{name}` has unknown metric `{metric}`"),
        })?;

        Ok(Some(CollectionInfo {
            id: id.to_string(),
            name: name.to_string(),
            dimension: usize::try_from(dimension).unwrap_or_default(),
            metric,
        }))
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<CollectionInfo, StoreError> {
        let dimension_column = i32::try_from(dimension).map_err(|_| {
            StoreError::InvalidArgument(format!("dimension {dimension} is too large"))
        })?;
        let id = Uuid::new_v4();

        let inserted = sqlx::query(
            "INSERT INTO ingest_collections (id, name, dimension, metric) VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(id)
        .bind(name)
        .bind(dimension_column)
        .bind(metric.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(collection = name, dimension, %metric, "collection created");
            self.create_hnsw_index(id, dimension, metric).await;
        }

        self.collection(name).await?.ok_or_else(|| StoreError::Backend {
            backend: "postgres".to_string(),
            details: format!("collection `{name}` vanished after creation"),
        })
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        let Some(existing) = self.collection(name).await? else {
            return Ok(());
        };
        let id = collection_uuid(&existing)?;

        sqlx::query(&format!("DROP INDEX IF EXISTS {}", index_name(id)))
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM ingest_collections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        info!(collection = name, "collection dropped");
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &CollectionInfo,
        records: &[VectorRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(bad) = records
            .iter()
            .find(|record| record.embedding.len() != collection.dimension)
        {
            return Err(StoreError::SchemaConflict {
                collection: collection.name.clone(),
                expected: collection.dimension,
                actual: bad.embedding.len(),
            });
        }

        let collection_id = collection_uuid(collection)?;
        // A fixed row order keeps concurrent batches from deadlocking.
        let mut ordered = records.iter().collect::<Vec<_>>();
        ordered.sort_by(|left, right| left.id.cmp(&right.id));

        let mut transaction = self.pool.begin().await?;
        for record in ordered {
            sqlx::query(UPSERT)
                .bind(collection_id)
                .bind(&record.id)
                .bind(&record.text)
                .bind(Json(&record.metadata))
                .bind(Vector::from(record.embedding.clone()))
                .bind(&record.model)
                .execute(&mut *transaction)
                .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &CollectionInfo,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchResult>, StoreError> {
        if vector.len() != collection.dimension {
            return Err(StoreError::SchemaConflict {
                collection: collection.name.clone(),
                expected: collection.dimension,
                actual: vector.len(),
            });
        }

        let collection_id = collection_uuid(collection)?;
        let mut builder = search_query(
            collection_id,
            collection.dimension,
            collection.metric,
            vector,
            k,
            filter,
        );
        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| -> Result<SearchResult, StoreError> {
                let Json(metadata): Json<Value> = row.try_get("metadata")?;
                let distance: f64 = row.try_get("distance")?;
                Ok(SearchResult {
                    id: row.try_get("id")?,
                    text: row.try_get("document")?,
                    metadata,
                    score: distance_to_score(collection.metric, distance),
                })
            })
            .collect()
    }

    async fn count(&self, collection: &CollectionInfo) -> Result<u64, StoreError> {
        let collection_id = collection_uuid(collection)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_records WHERE collection_id = $1")
            .bind(collection_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
