use crate::error::PipelineError;
use crate::models::DistanceMetric;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub recursive: bool,
    pub pdf_language: String,
    pub premium_mode: bool,
    pub llama_parse_api_key: Option<String>,
    pub llama_parse_base_url: String,
    pub llama_parse_timeout: Duration,
    pub llama_parse_poll_interval: Duration,
    pub max_pdf_size_mb: u64,
    pub parsing_instruction: Option<String>,
    pub filename_metadata: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            pdf_language: "vi".to_string(),
            premium_mode: false,
            llama_parse_api_key: None,
            llama_parse_base_url: "https://api.cloud.llamaindex.ai".to_string(),
            llama_parse_timeout: Duration::from_secs(600),
            llama_parse_poll_interval: Duration::from_secs(2),
            max_pdf_size_mb: 150,
            parsing_instruction: None,
            filename_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningConfig {
    pub normalize_whitespace: bool,
    pub strip_urls_and_emails: bool,
    pub normalize_characters: bool,
    pub deduplicate: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            normalize_whitespace: true,
            strip_urls_and_emails: false,
            normalize_characters: false,
            deduplicate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    /// When set, documents are first cut into parents of this size and the
    /// embedded chunks are the children of each parent.
    pub parent_max_chars: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_000,
            overlap_chars: 200,
            parent_max_chars: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Vertex AI `:predict` or the Generative Language `:batchEmbedContents` API.
    Google,
    /// Offline character n-gram hashing.
    Local,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" | "vertex" | "gemini" => Some(Self::Google),
            "local" | "ngram" => Some(Self::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub dimension: usize,
    pub project_id: Option<String>,
    pub location: String,
    pub access_token: Option<String>,
    /// Service-account key file used to mint Vertex access tokens.
    pub credentials_file: Option<PathBuf>,
    pub api_key: Option<String>,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    pub document_prefix: String,
    pub query_prefix: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Google,
            model: "text-embedding-004".to_string(),
            dimension: 768,
            project_id: None,
            location: "us-central1".to_string(),
            access_token: None,
            credentials_file: None,
            api_key: None,
            batch_size: 100,
            max_concurrency: 4,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            document_prefix: String::new(),
            query_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl StoreKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgvector" => Some(Self::Postgres),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub collection_name: String,
    pub metric: DistanceMetric,
    pub connection_string: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub max_connections: u32,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Postgres,
            collection_name: "documents".to_string(),
            metric: DistanceMetric::Cosine,
            connection_string: None,
            host: "localhost".to_string(),
            port: 5432,
            database: "vectordb".to_string(),
            user: "postgres".to_string(),
            password: None,
            max_connections: 8,
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// The connection string with any SQLAlchemy driver suffix removed
    /// (`postgresql+psycopg://` becomes `postgresql://`).
    pub fn normalized_connection_string(&self) -> Option<String> {
        self.connection_string.as_deref().map(|raw| {
            let raw = raw.trim();
            match raw.split_once("://") {
                Some((scheme, rest)) => {
                    let scheme = scheme.split('+').next().unwrap_or(scheme);
                    format!("{scheme}://{rest}")
                }
                None => raw.to_string(),
            }
        })
    }
}

/// Built once by the caller and handed to each component by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub loader: LoaderConfig,
    pub cleaning: CleaningConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub store: StoreConfig,
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            cleaning: CleaningConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            store: StoreConfig::default(),
            concurrency: 4,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |message: String| Err(PipelineError::Config(message));

        if self.chunking.max_chars == 0 {
            return invalid("chunk size must be positive".to_string());
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            return invalid(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                self.chunking.overlap_chars, self.chunking.max_chars
            ));
        }
        if let Some(parent) = self.chunking.parent_max_chars {
            if parent <= self.chunking.max_chars {
                return invalid(format!(
                    "parent chunk size {parent} must exceed chunk size {}",
                    self.chunking.max_chars
                ));
            }
        }
        if self.embedding.batch_size == 0 {
            return invalid("embedding batch size must be positive".to_string());
        }
        if self.embedding.max_concurrency == 0 || self.concurrency == 0 {
            return invalid("concurrency must be positive".to_string());
        }
        if self.embedding.max_attempts == 0 || self.store.max_attempts == 0 {
            return invalid("retry attempts must be positive".to_string());
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding dimension must be positive".to_string());
        }
        if self.store.collection_name.trim().is_empty() {
            return invalid("collection name must not be empty".to_string());
        }
        if self.embedding.provider == ProviderKind::Google
            && self.embedding.api_key.is_none()
            && self.embedding.access_token.is_none()
            && self.embedding.credentials_file.is_none()
        {
            return invalid(
                "google embeddings need service-account credentials, an access token or an API key"
                    .to_string(),
            );
        }
        if self.store.kind == StoreKind::Postgres
            && self.store.connection_string.is_none()
            && self.store.password.is_none()
        {
            return invalid(
                "postgres needs a connection string or a password".to_string(),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.embedding.provider = ProviderKind::Local;
        config.store.kind = StoreKind::Memory;
        config
    }

    #[test]
    fn default_offline_config_is_valid() {
        assert!(offline().validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut config = offline();
        config.chunking.overlap_chars = config.chunking.max_chars;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn postgres_requires_credentials() {
        let mut config = offline();
        config.store.kind = StoreKind::Postgres;
        assert!(config.validate().is_err());

        config.store.password = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sqlalchemy_driver_suffix_is_stripped() {
        let store = StoreConfig {
            connection_string: Some("postgresql+psycopg://u:p@db:5432/vectors".to_string()),
            ..StoreConfig::default()
        };
        assert_eq!(
            store.normalized_connection_string().as_deref(),
            Some("postgresql://u:p@db:5432/vectors")
        );
    }
}
