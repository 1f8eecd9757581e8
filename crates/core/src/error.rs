use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format `{extension}` for {path}")]
    UnsupportedFormat { path: String, extension: String },

    #[error("failed to parse {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl IngestError {
    pub fn parse(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Classification reported by an embedding provider for a single request.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Rate limiting, timeouts, 5xx. Worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Authentication, quota exhaustion, malformed request.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum EmbeddingError {
    #[error("embedding batch {batch} failed after {attempts} attempt(s): {reason}")]
    Failed {
        batch: usize,
        attempts: u32,
        reason: String,
    },

    #[error("embedding provider rejected the run: {0}")]
    ProviderFatal(String),

    #[error("invalid embedding input: {0}")]
    InvalidInput(String),
}

impl EmbeddingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProviderFatal(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection `{collection}` has dimension {expected}, got {actual}")]
    SchemaConflict {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("vector store connection error: {0}")]
    Connection(String),

    #[error("invalid response from {backend}: {details}")]
    Backend { backend: String, details: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("query embedding failed: {0}")]
    Query(#[from] EmbeddingError),
}

impl StoreError {
    /// Only connection-level failures are retried at the store boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(error.to_string()),
            other => Self::Backend {
                backend: "postgres".to_string(),
                details: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("source error: {0}")]
    Source(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ingestion aborted after {committed} committed batch(es)")]
    Aborted { committed: usize },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
