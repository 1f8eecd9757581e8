pub mod catalog;
pub mod chunking;
pub mod cleaning;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod llama_parse;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod retry;
pub mod store;
pub mod stores;
pub mod traits;

pub use catalog::{CatalogEntry, CatalogParser};
pub use chunking::{make_chunk_id, make_parent_id, reconstruct, ChunkSpan, ChunkStats, Chunker};
pub use cleaning::{Cleaner, CleaningSession};
pub use config::{
    ChunkingConfig, CleaningConfig, EmbeddingConfig, LoaderConfig, PipelineConfig, ProviderKind,
    StoreConfig, StoreKind,
};
pub use embeddings::EmbeddingService;
pub use error::{EmbeddingError, IngestError, PipelineError, ProviderError, StoreError};
pub use extractor::{
    DocxExtractor, ExtractionChain, LopdfExtractor, MarkdownExtractor, PlainTextExtractor,
};
pub use llama_parse::LlamaParseExtractor;
pub use loader::{discover_files, Discovery, DocumentLoader, LoadReport, SkippedFile};
pub use models::{
    Chunk, ChunkMetadata, CleanedDocument, CollectionInfo, CollectionState, CollectionStats,
    DistanceMetric, Document, DocumentFormat, DocumentMetadata, EmbeddingVector,
    FilterCondition, MetadataFilter, ParserKind, SearchInput, SearchResult, VectorRecord,
};
pub use orchestrator::{AbortHandle, FailedBatch, IngestionPipeline, RunOptions, RunReport};
pub use providers::{
    build_provider, CharacterNgramEmbedder, GoogleEmbeddingProvider, ServiceAccountCredentials,
    VertexCredentials,
};
pub use retry::RetryPolicy;
pub use store::VectorStoreManager;
pub use stores::{connect_backend, MemoryVectorStore, PgVectorStore};
pub use traits::{EmbeddingIntent, EmbeddingProvider, PageExtractor, PageText, VectorBackend};
