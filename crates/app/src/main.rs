use anyhow::{anyhow, bail};
use chrono::Utc;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use rag_ingest_core::{
    ChunkingConfig, CleaningConfig, DistanceMetric, EmbeddingConfig, IngestionPipeline,
    LoaderConfig, MetadataFilter, PipelineConfig, ProviderKind, RunOptions, RunReport,
    SearchInput, StoreConfig, StoreKind,
};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rag-ingest", version, about = "Ingest documents into a vector collection for RAG")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Collection to ingest into or query.
    #[arg(long, env = "COLLECTION_NAME", default_value = "documents", global = true)]
    collection_name: String,

    /// Embedding provider: google or local.
    #[arg(long, env = "EMBEDDING_PROVIDER", default_value = "google")]
    embedding_provider: String,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-004")]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSION", default_value = "768")]
    embedding_dimension: usize,

    #[arg(long, env = "VERTEX_PROJECT_ID")]
    vertex_project_id: Option<String>,

    #[arg(long, env = "VERTEX_LOCATION", default_value = "us-central1")]
    vertex_location: String,

    /// Service-account key file; Vertex tokens are minted and refreshed from it.
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    google_application_credentials: Option<PathBuf>,

    /// Pre-issued OAuth access token for Vertex AI.
    #[arg(long, env = "VERTEX_ACCESS_TOKEN", hide_env_values = true)]
    vertex_access_token: Option<String>,

    /// API key for the Generative Language API.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    google_api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_BATCH_SIZE", default_value = "100")]
    embedding_batch_size: usize,

    /// Ceiling for concurrent embedding and upsert batches.
    #[arg(long, env = "EMBEDDING_CONCURRENCY", default_value = "4")]
    embedding_concurrency: usize,

    #[arg(long, env = "EMBEDDING_MAX_ATTEMPTS", default_value = "5")]
    embedding_max_attempts: u32,

    #[arg(long, env = "EMBEDDING_DOCUMENT_PREFIX", default_value = "")]
    embedding_document_prefix: String,

    #[arg(long, env = "EMBEDDING_QUERY_PREFIX", default_value = "")]
    embedding_query_prefix: String,

    /// Maximum chunk size in characters.
    #[arg(long, env = "CHUNK_SIZE", default_value = "1000")]
    chunk_size: usize,

    /// Characters shared between consecutive chunks.
    #[arg(long, env = "CHUNK_OVERLAP", default_value = "200")]
    chunk_overlap: usize,

    /// Enables parent/child chunking: parents of this size, children of
    /// `--chunk-size`.
    #[arg(long, env = "PARENT_CHUNK_SIZE")]
    parent_chunk_size: Option<usize>,

    /// cosine, euclidean or inner_product.
    #[arg(long, env = "DISTANCE_METRIC", default_value = "cosine")]
    distance_metric: String,

    /// postgres or memory.
    #[arg(long, env = "VECTOR_STORE", default_value = "postgres")]
    vector_store: String,

    /// Full connection string; SQLAlchemy driver suffixes are accepted.
    #[arg(long, env = "PG_CONNECTION_STRING", hide_env_values = true)]
    pg_connection_string: Option<String>,

    #[arg(long, env = "PG_HOST", default_value = "localhost")]
    pg_host: String,

    #[arg(long, env = "PG_PORT", default_value = "5432")]
    pg_port: u16,

    #[arg(long, env = "PG_DATABASE", default_value = "vectordb")]
    pg_database: String,

    #[arg(long, env = "PG_USER", default_value = "postgres")]
    pg_user: String,

    #[arg(long, env = "PG_PASSWORD", hide_env_values = true)]
    pg_password: Option<String>,

    /// Language hint for the advanced PDF parser.
    #[arg(long, env = "PDF_LANGUAGE", default_value = "vi")]
    pdf_language: String,

    #[arg(long, env = "USE_PREMIUM_PDF_MODE", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    use_premium_pdf_mode: bool,

    /// Enables LlamaParse for PDFs when set.
    #[arg(long, env = "LLAMA_CLOUD_API_KEY", hide_env_values = true)]
    llama_cloud_api_key: Option<String>,

    #[arg(long, env = "MAX_PDF_SIZE_MB", default_value = "150")]
    max_pdf_size_mb: u64,

    #[arg(long, env = "RECURSIVE", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    recursive: bool,

    #[arg(long, env = "CLEAN_STRIP_URLS", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    clean_strip_urls: bool,

    #[arg(long, env = "CLEAN_NORMALIZE_CHARACTERS", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    clean_normalize_characters: bool,

    #[arg(long, env = "CLEAN_DEDUPLICATE", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    clean_deduplicate: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Load, clean, chunk, embed and upsert every document under a directory.
    Ingest {
        /// Directory (or single file) to ingest.
        #[arg(long, default_value = "./data/documents")]
        docs_dir: PathBuf,
        /// Drop and recreate the collection first.
        #[arg(long, default_value_t = false)]
        reset: bool,
    },
    /// Similarity search over the collection.
    Search {
        query: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Metadata equality filter, `key=value`. Repeatable.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, Value)>,
    },
    /// Record count and schema of the collection.
    Stats,
    /// Drop and recreate the collection.
    Reset,
}

/// `grade=2` filters on the number 2, `source_file=x.txt` on the string.
fn parse_filter(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty filter key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

impl Cli {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let provider = ProviderKind::parse(&self.embedding_provider)
            .ok_or_else(|| anyhow!("unknown embedding provider `{}`", self.embedding_provider))?;
        let kind = StoreKind::parse(&self.vector_store)
            .ok_or_else(|| anyhow!("unknown vector store `{}`", self.vector_store))?;
        let metric = DistanceMetric::parse(&self.distance_metric)
            .ok_or_else(|| anyhow!("unknown distance metric `{}`", self.distance_metric))?;

        let config = PipelineConfig {
            loader: LoaderConfig {
                recursive: self.recursive,
                pdf_language: self.pdf_language.clone(),
                premium_mode: self.use_premium_pdf_mode,
                llama_parse_api_key: self.llama_cloud_api_key.clone(),
                max_pdf_size_mb: self.max_pdf_size_mb,
                ..LoaderConfig::default()
            },
            cleaning: CleaningConfig {
                normalize_whitespace: true,
                strip_urls_and_emails: self.clean_strip_urls,
                normalize_characters: self.clean_normalize_characters,
                deduplicate: self.clean_deduplicate,
            },
            chunking: ChunkingConfig {
                max_chars: self.chunk_size,
                overlap_chars: self.chunk_overlap,
                parent_max_chars: self.parent_chunk_size,
            },
            embedding: EmbeddingConfig {
                provider,
                model: self.embedding_model.clone(),
                dimension: self.embedding_dimension,
                project_id: self.vertex_project_id.clone(),
                location: self.vertex_location.clone(),
                access_token: self.vertex_access_token.clone(),
                credentials_file: self.google_application_credentials.clone(),
                api_key: self.google_api_key.clone(),
                batch_size: self.embedding_batch_size,
                max_concurrency: self.embedding_concurrency,
                max_attempts: self.embedding_max_attempts,
                document_prefix: self.embedding_document_prefix.clone(),
                query_prefix: self.embedding_query_prefix.clone(),
                ..EmbeddingConfig::default()
            },
            store: StoreConfig {
                kind,
                collection_name: self.collection_name.clone(),
                metric,
                connection_string: self.pg_connection_string.clone(),
                host: self.pg_host.clone(),
                port: self.pg_port,
                database: self.pg_database.clone(),
                user: self.pg_user.clone(),
                password: self.pg_password.clone(),
                ..StoreConfig::default()
            },
            concurrency: self.embedding_concurrency,
        };

        config.validate()?;
        Ok(config)
    }
}

fn print_report(report: &RunReport) {
    println!("collection: {}", report.collection);
    println!(
        "files: {} discovered, {} loaded, {} skipped",
        report.files_discovered,
        report.files_loaded,
        report.skipped_files.len()
    );
    for skipped in &report.skipped_files {
        println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    println!(
        "documents: {} ({} duplicates removed)",
        report.documents, report.duplicates_removed
    );
    println!(
        "chunks: {} (min {} / avg {} / max {} chars)",
        report.chunk_stats.count,
        report.chunk_stats.min_chars,
        report.chunk_stats.avg_chars,
        report.chunk_stats.max_chars
    );
    println!(
        "batches: {}/{} committed, {} failed",
        report.batches_committed,
        report.batches_total,
        report.failed_batches.len()
    );
    for failed in &report.failed_batches {
        println!("  batch {} ({} chunks): {}", failed.index, failed.chunks, failed.reason);
    }
    println!("records upserted: {}", report.records_upserted);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "rag-ingest boot"
    );

    let config = cli.pipeline_config()?;
    let pipeline = IngestionPipeline::connect(&config).await?;
    let collection = config.store.collection_name.as_str();

    match cli.command {
        Command::Ingest { docs_dir, reset } => {
            let abort = pipeline.abort_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, letting in-flight batches finish");
                    abort.abort();
                }
            });

            info!(docs_dir = %docs_dir.display(), collection, reset, "ingestion started");
            let report = pipeline
                .run(
                    &docs_dir,
                    &RunOptions {
                        reset,
                        collection_name: None,
                    },
                )
                .await?;
            print_report(&report);
            println!("finished at {}", Utc::now().to_rfc3339());

            if !report.is_complete() {
                bail!(
                    "{} of {} batch(es) failed; re-run to retry them",
                    report.failed_batches.len(),
                    report.batches_total
                );
            }
        }
        Command::Search {
            query,
            top_k,
            filters,
        } => {
            let filter = filters
                .into_iter()
                .fold(MetadataFilter::new(), |filter, (key, value)| filter.equals(key, value));
            let hits = pipeline
                .store()
                .similarity_search(collection, SearchInput::Text(query.clone()), top_k, &filter)
                .await?;

            println!("query: {query}");
            for (rank, hit) in hits.iter().enumerate() {
                let source = hit
                    .metadata
                    .get("source_file")
                    .and_then(Value::as_str)
                    .unwrap_or("-");
                let page = hit
                    .metadata
                    .get("page")
                    .and_then(Value::as_u64)
                    .map(|page| format!(" page={page}"))
                    .unwrap_or_default();
                println!(
                    "[{}] score={:.4} source={source}{page} id={}",
                    rank + 1,
                    hit.score,
                    hit.id
                );
                println!("  {}", hit.text.replace('\n', "\n  "));
            }
            if hits.is_empty() {
                println!("no results");
            }
        }
        Command::Stats => {
            let stats = pipeline.store().stats(collection).await?;
            println!("collection: {}", stats.name);
            println!("state: {:?}", stats.state);
            println!("records: {}", stats.record_count);
            if let (Some(dimension), Some(metric)) = (stats.dimension, stats.metric) {
                println!("dimension: {dimension}");
                println!("metric: {metric}");
            }
        }
        Command::Reset => {
            let info = pipeline.store().reset(collection).await?;
            println!(
                "collection {} reset (dimension {}, metric {})",
                info.name, info.dimension, info.metric
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn filters_parse_json_scalars_and_fall_back_to_strings() {
        assert_eq!(
            parse_filter("grade=2"),
            Ok(("grade".to_string(), serde_json::json!(2)))
        );
        assert_eq!(
            parse_filter("source_file=x.txt"),
            Ok(("source_file".to_string(), Value::String("x.txt".to_string())))
        );
        assert!(parse_filter("no-separator").is_err());
        assert!(parse_filter("=value").is_err());
    }

    #[test]
    fn offline_flags_build_a_valid_config() {
        let cli = Cli::parse_from([
            "rag-ingest",
            "--embedding-provider",
            "local",
            "--vector-store",
            "memory",
            "--chunk-size",
            "500",
            "--chunk-overlap",
            "50",
            "stats",
        ]);
        let config = cli.pipeline_config().expect("config is valid");
        assert_eq!(config.chunking.max_chars, 500);
        assert_eq!(config.store.kind, StoreKind::Memory);
    }

    #[test]
    fn hierarchical_and_service_account_flags_reach_the_config() {
        let cli = Cli::parse_from([
            "rag-ingest",
            "--embedding-provider",
            "local",
            "--vector-store",
            "memory",
            "--chunk-size",
            "500",
            "--chunk-overlap",
            "100",
            "--parent-chunk-size",
            "2000",
            "--google-application-credentials",
            "/secrets/sa.json",
            "stats",
        ]);
        let config = cli.pipeline_config().expect("config is valid");
        assert_eq!(config.chunking.parent_max_chars, Some(2000));
        assert_eq!(
            config.embedding.credentials_file,
            Some(PathBuf::from("/secrets/sa.json"))
        );

        let cli = Cli::parse_from([
            "rag-ingest",
            "--embedding-provider",
            "local",
            "--vector-store",
            "memory",
            "--chunk-size",
            "500",
            "--chunk-overlap",
            "100",
            "--parent-chunk-size",
            "400",
            "stats",
        ]);
        assert!(cli.pipeline_config().is_err());
    }
}
