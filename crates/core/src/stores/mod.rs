pub mod memory;
pub mod pgvector;

pub use memory::MemoryVectorStore;
pub use pgvector::PgVectorStore;

use crate::config::{StoreConfig, StoreKind};
use crate::error::StoreError;
use crate::traits::VectorBackend;
use std::sync::Arc;

pub async fn connect_backend(config: &StoreConfig) -> Result<Arc<dyn VectorBackend>, StoreError> {
    match config.kind {
        StoreKind::Postgres => Ok(Arc::new(PgVectorStore::connect(config).await?)),
        StoreKind::Memory => Ok(Arc::new(MemoryVectorStore::new())),
    }
}
