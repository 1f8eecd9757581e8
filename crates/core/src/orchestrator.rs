use crate::chunking::{ChunkStats, Chunker};
use crate::cleaning::Cleaner;
use crate::config::PipelineConfig;
use crate::embeddings::EmbeddingService;
use crate::error::{EmbeddingError, PipelineError};
use crate::loader::{DocumentLoader, SkippedFile};
use crate::models::Chunk;
use crate::providers::build_provider;
use crate::store::VectorStoreManager;
use crate::stores::connect_backend;
use crate::traits::{EmbeddingProvider, VectorBackend};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Drop and recreate the collection before ingesting.
    pub reset: bool,
    pub collection_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FailedBatch {
    pub index: usize,
    pub chunks: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub collection: String,
    pub files_discovered: usize,
    pub files_loaded: usize,
    pub skipped_files: Vec<SkippedFile>,
    pub documents: usize,
    pub duplicates_removed: usize,
    pub chunk_stats: ChunkStats,
    pub batches_total: usize,
    pub batches_committed: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub records_upserted: usize,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty() && self.batches_committed == self.batches_total
    }
}

/// Cloneable handle that stops a running pipeline from scheduling new
/// batches. Batches already in flight still finish.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

enum BatchOutcome {
    Committed(usize),
    Failed(FailedBatch),
    Fatal(PipelineError),
    Skipped,
}

/// Loader, Cleaner, Chunker, EmbeddingService and VectorStoreManager composed
/// into one run.
pub struct IngestionPipeline {
    loader: DocumentLoader,
    cleaner: Cleaner,
    chunker: Chunker,
    embeddings: Arc<EmbeddingService>,
    store: Arc<VectorStoreManager>,
    concurrency: usize,
    abort: AbortHandle,
}

impl IngestionPipeline {
    pub fn new(
        config: &PipelineConfig,
        provider: Arc<dyn EmbeddingProvider>,
        backend: Arc<dyn VectorBackend>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let component = |error: crate::error::IngestError| PipelineError::Config(error.to_string());

        let embeddings = Arc::new(EmbeddingService::new(provider, &config.embedding)?);
        let store = Arc::new(VectorStoreManager::new(
            backend,
            embeddings.clone(),
            &config.store,
        ));

        Ok(Self {
            loader: DocumentLoader::new(&config.loader).map_err(component)?,
            cleaner: Cleaner::new(&config.cleaning).map_err(component)?,
            chunker: Chunker::new(&config.chunking).map_err(component)?,
            embeddings,
            store,
            concurrency: config.concurrency.max(1),
            abort: AbortHandle::default(),
        })
    }

    /// Builds the configured provider and connects the configured backend.
    pub async fn connect(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let provider = build_provider(&config.embedding)?;
        let backend = connect_backend(&config.store).await?;
        Self::new(config, provider, backend)
    }

    pub fn with_loader(mut self, loader: DocumentLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn store(&self) -> &Arc<VectorStoreManager> {
        &self.store
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// One full ingestion over `source`. Bad files are skipped and batches
    /// that exhaust their retries are reported; a permanent provider error or
    /// any store error stops the run once in-flight batches have finished.
    pub async fn run(&self, source: &Path, options: &RunOptions) -> Result<RunReport, PipelineError> {
        let collection = options
            .collection_name
            .clone()
            .unwrap_or_else(|| self.store.collection_name().to_string());
        let mut report = RunReport {
            collection: collection.clone(),
            ..RunReport::default()
        };

        if options.reset {
            self.store.reset(&collection).await?;
        }

        let loaded = self
            .loader
            .load_path(source)
            .await
            .map_err(|error| PipelineError::Source(error.to_string()))?;
        report.files_discovered = loaded.files_seen;
        report.files_loaded = loaded.files_seen - loaded.skipped_files.len();
        report.skipped_files = loaded.skipped_files;
        report.documents = loaded.documents.len();
        info!(
            files = report.files_discovered,
            skipped = report.skipped_files.len(),
            documents = report.documents,
            "documents loaded"
        );

        let mut session = self.cleaner.session();
        let cleaned = session.clean(loaded.documents);
        report.duplicates_removed = session.duplicates_removed();

        let chunks = self.chunker.chunk_documents(&cleaned);
        report.chunk_stats = ChunkStats::from_chunks(&chunks);
        info!(
            chunks = report.chunk_stats.count,
            min = report.chunk_stats.min_chars,
            max = report.chunk_stats.max_chars,
            avg = report.chunk_stats.avg_chars,
            "documents chunked"
        );

        let batches = chunks
            .chunks(self.embeddings.batch_size())
            .enumerate()
            .collect::<Vec<_>>();
        report.batches_total = batches.len();

        let halted = AtomicBool::new(false);
        let (stop, target) = (&halted, collection.as_str());
        let mut outcomes = stream::iter(batches)
            .map(move |(index, batch)| self.process_batch(target, index, batch, stop))
            .buffer_unordered(self.concurrency);

        let mut fatal = None;
        let mut skipped = 0usize;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                BatchOutcome::Committed(records) => {
                    report.batches_committed += 1;
                    report.records_upserted += records;
                }
                BatchOutcome::Failed(failed) => report.failed_batches.push(failed),
                BatchOutcome::Fatal(error) => {
                    if fatal.is_none() {
                        fatal = Some(error);
                    }
                }
                BatchOutcome::Skipped => skipped += 1,
            }
        }

        if let Some(error) = fatal {
            error!(
                %error,
                committed = report.batches_committed,
                "run stopped, committed batches are kept"
            );
            return Err(error);
        }
        if skipped > 0 && self.abort.is_aborted() {
            return Err(PipelineError::Aborted {
                committed: report.batches_committed,
            });
        }

        info!(
            collection = %collection,
            committed = report.batches_committed,
            failed = report.failed_batches.len(),
            records = report.records_upserted,
            "ingestion finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        collection: &str,
        index: usize,
        batch: &[Chunk],
        stop: &AtomicBool,
    ) -> BatchOutcome {
        if stop.load(Ordering::SeqCst) || self.abort.is_aborted() {
            return BatchOutcome::Skipped;
        }

        let vectors = match self.embeddings.embed_batch(index, batch).await {
            Ok(vectors) => vectors,
            Err(error @ EmbeddingError::ProviderFatal(_)) => {
                stop.store(true, Ordering::SeqCst);
                return BatchOutcome::Fatal(error.into());
            }
            Err(error) => {
                warn!(batch = index, %error, "batch skipped");
                return BatchOutcome::Failed(FailedBatch {
                    index,
                    chunks: batch.len(),
                    reason: error.to_string(),
                });
            }
        };

        let items = batch.iter().cloned().zip(vectors).collect::<Vec<_>>();
        match self.store.upsert(collection, &items).await {
            Ok(records) => BatchOutcome::Committed(records),
            Err(error) => {
                stop.store(true, Ordering::SeqCst);
                BatchOutcome::Fatal(error.into())
            }
        }
    }
}
