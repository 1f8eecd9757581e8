pub mod google;
pub mod ngram;
pub mod service_account;

pub use google::{GoogleAuth, GoogleEmbeddingProvider, VertexCredentials};
pub use service_account::ServiceAccountCredentials;
pub use ngram::{CharacterNgramEmbedder, NGRAM_MODEL_ID};

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::error::PipelineError;
use crate::traits::EmbeddingProvider;
use std::sync::Arc;

pub fn build_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
    match config.provider {
        ProviderKind::Google => {
            let provider = GoogleEmbeddingProvider::from_config(config)
                .map_err(|error| PipelineError::Config(error.to_string()))?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Local => Ok(Arc::new(CharacterNgramEmbedder::new(config.dimension))),
    }
}
