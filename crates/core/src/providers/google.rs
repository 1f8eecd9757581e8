//! Google text embeddings, either through Vertex AI `:predict` with a bearer
//! token or through the Generative Language `:batchEmbedContents` API with an
//! API key.

use super::service_account::ServiceAccountCredentials;
use crate::config::EmbeddingConfig;
use crate::error::ProviderError;
use crate::traits::{EmbeddingIntent, EmbeddingProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Where Vertex bearer tokens come from.
#[derive(Debug, Clone)]
pub enum VertexCredentials {
    /// A pre-issued token, used as-is until it expires.
    AccessToken(String),
    ServiceAccount(Arc<ServiceAccountCredentials>),
}

impl VertexCredentials {
    async fn bearer(&self) -> Result<String, ProviderError> {
        match self {
            Self::AccessToken(token) => Ok(token.clone()),
            Self::ServiceAccount(account) => account.access_token().await,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GoogleAuth {
    Vertex {
        project_id: String,
        location: String,
        credentials: VertexCredentials,
    },
    ApiKey(String),
}

pub struct GoogleEmbeddingProvider {
    client: Client,
    auth: GoogleAuth,
    model: String,
    dimensions: usize,
}

impl GoogleEmbeddingProvider {
    pub fn new(
        auth: GoogleAuth,
        model: impl Into<String>,
        dimensions: usize,
        timeout: std::time::Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self::with_client(http_client(timeout)?, auth, model, dimensions))
    }

    fn with_client(
        client: Client,
        auth: GoogleAuth,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client,
            auth,
            model: model.into(),
            dimensions,
        }
    }

    /// Vertex with a service-account key file, then Vertex with a raw access
    /// token, then the API key.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let client = http_client(config.request_timeout)?;

        let vertex = if let Some(path) = &config.credentials_file {
            let account = ServiceAccountCredentials::from_file(path, client.clone())?;
            let project_id = config
                .project_id
                .clone()
                .or_else(|| account.project_id().map(str::to_string))
                .ok_or_else(|| {
                    ProviderError::Permanent(format!(
                        "no project id configured and none in {}",
                        path.display()
                    ))
                })?;
            Some(GoogleAuth::Vertex {
                project_id,
                location: config.location.clone(),
                credentials: VertexCredentials::ServiceAccount(Arc::new(account)),
            })
        } else {
            match (&config.project_id, &config.access_token) {
                (Some(project_id), Some(access_token)) => Some(GoogleAuth::Vertex {
                    project_id: project_id.clone(),
                    location: config.location.clone(),
                    credentials: VertexCredentials::AccessToken(access_token.clone()),
                }),
                _ => None,
            }
        };

        let auth = match (vertex, &config.api_key) {
            (Some(vertex), _) => vertex,
            (None, Some(key)) => GoogleAuth::ApiKey(key.clone()),
            (None, None) => {
                return Err(ProviderError::Permanent(
                    "google embeddings need service-account credentials, a project id with an access token, or an API key"
                        .to_string(),
                ))
            }
        };

        Ok(Self::with_client(client, auth, &config.model, config.dimension))
    }

    fn vertex_endpoint(&self, project_id: &str, location: &str) -> String {
        format!(
            "https://{location}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{location}/publishers/google/models/{}:predict",
            self.model
        )
    }

    async fn embed_vertex(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
        project_id: &str,
        location: &str,
        credentials: &VertexCredentials,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = vertex_request(texts, intent, self.dimensions);
        let token = credentials.bearer().await?;
        let response = self
            .client
            .post(self.vertex_endpoint(project_id, location))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let body: PredictResponse = read_json(response).await?;
        Ok(body
            .predictions
            .into_iter()
            .map(|prediction| prediction.embeddings.values)
            .collect())
    }

    async fn embed_gemini(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
        api_key: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = gemini_request(&self.model, texts, intent, self.dimensions);
        let response = self
            .client
            .post(format!(
                "{GEMINI_BASE_URL}/models/{}:batchEmbedContents",
                self.model
            ))
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let body: BatchEmbedResponse = read_json(response).await?;
        Ok(body
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

#[async_trait]
impl EmbeddingProvider for GoogleEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_texts(
        &self,
        texts: &[String],
        intent: EmbeddingIntent,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.auth {
            GoogleAuth::Vertex {
                project_id,
                location,
                credentials,
            } => {
                self.embed_vertex(texts, intent, project_id, location, credentials)
                    .await
            }
            GoogleAuth::ApiKey(key) => self.embed_gemini(texts, intent, key).await,
        }
    }
}

fn http_client(timeout: std::time::Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|error| ProviderError::Permanent(format!("http client: {error}")))
}

fn task_type(intent: EmbeddingIntent) -> &'static str {
    match intent {
        EmbeddingIntent::Document => "RETRIEVAL_DOCUMENT",
        EmbeddingIntent::Query => "RETRIEVAL_QUERY",
    }
}

#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<PredictInstance>,
    parameters: PredictParameters,
}

#[derive(Debug, Serialize)]
struct PredictInstance {
    content: String,
    task_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    output_dimensionality: usize,
    auto_truncate: bool,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    embeddings: Values,
}

#[derive(Debug, Deserialize)]
struct Values {
    values: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest {
    model: String,
    content: Content,
    task_type: &'static str,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Values>,
}

fn vertex_request(texts: &[String], intent: EmbeddingIntent, dimensions: usize) -> PredictRequest {
    PredictRequest {
        instances: texts
            .iter()
            .map(|text| PredictInstance {
                content: text.clone(),
                task_type: task_type(intent),
            })
            .collect(),
        parameters: PredictParameters {
            output_dimensionality: dimensions,
            auto_truncate: true,
        },
    }
}

fn gemini_request(
    model: &str,
    texts: &[String],
    intent: EmbeddingIntent,
    dimensions: usize,
) -> BatchEmbedRequest {
    BatchEmbedRequest {
        requests: texts
            .iter()
            .map(|text| EmbedContentRequest {
                model: format!("models/{model}"),
                content: Content {
                    parts: vec![Part { text: text.clone() }],
                },
                task_type: task_type(intent),
                output_dimensionality: dimensions,
            })
            .collect(),
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    response
        .json()
        .await
        .map_err(|error| ProviderError::Transient(format!("unreadable embedding response: {error}")))
}

/// 408, 429 and 5xx are worth retrying; everything else means the request
/// or the credential is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let body = body.chars().take(300).collect::<String>();
    let message = format!("google embeddings returned {status}: {body}");

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn classify_transport(error: reqwest::Error) -> ProviderError {
    if error.is_builder() {
        ProviderError::Permanent(error.to_string())
    } else {
        ProviderError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vertex_request_carries_task_type_and_dimension() {
        let request = vertex_request(&["hello".to_string()], EmbeddingIntent::Query, 256);
        let value = serde_json::to_value(&request).expect("request serializes");
        assert_eq!(
            value,
            json!({
                "instances": [{"content": "hello", "task_type": "RETRIEVAL_QUERY"}],
                "parameters": {"outputDimensionality": 256, "autoTruncate": true}
            })
        );
    }

    #[test]
    fn gemini_request_names_the_model_per_entry() {
        let request = gemini_request(
            "text-embedding-004",
            &["a".to_string(), "b".to_string()],
            EmbeddingIntent::Document,
            768,
        );
        let value = serde_json::to_value(&request).expect("request serializes");
        assert_eq!(value["requests"][1]["model"], json!("models/text-embedding-004"));
        assert_eq!(value["requests"][1]["content"]["parts"][0]["text"], json!("b"));
        assert_eq!(value["requests"][0]["taskType"], json!("RETRIEVAL_DOCUMENT"));
    }

    #[test]
    fn responses_parse_in_order() {
        let predict: PredictResponse = serde_json::from_value(json!({
            "predictions": [
                {"embeddings": {"values": [0.1, 0.2], "statistics": {"token_count": 2}}},
                {"embeddings": {"values": [0.3, 0.4]}}
            ]
        }))
        .expect("predict response parses");
        assert_eq!(predict.predictions[1].embeddings.values, vec![0.3, 0.4]);

        let batch: BatchEmbedResponse =
            serde_json::from_value(json!({"embeddings": [{"values": [1.0]}]}))
                .expect("batch response parses");
        assert_eq!(batch.embeddings[0].values, vec![1.0]);
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad token").is_transient());
        assert!(!classify_status(StatusCode::FORBIDDEN, "billing disabled").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad input").is_transient());
    }

    #[test]
    fn vertex_is_preferred_when_a_project_token_is_present() {
        let config = EmbeddingConfig {
            project_id: Some("proj".to_string()),
            access_token: Some("token".to_string()),
            api_key: Some("key".to_string()),
            ..EmbeddingConfig::default()
        };
        let provider = GoogleEmbeddingProvider::from_config(&config).expect("provider builds");
        assert!(matches!(provider.auth, GoogleAuth::Vertex { .. }));
        assert_eq!(provider.model_id(), "text-embedding-004");

        let missing = GoogleEmbeddingProvider::from_config(&EmbeddingConfig::default());
        assert!(missing.is_err());
    }

    #[test]
    fn credentials_file_selects_service_account_auth() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("service-account.json");
        std::fs::write(
            &path,
            crate::providers::service_account::tests::key_json("https://oauth2.googleapis.com/token"),
        )
        .expect("key written");

        let config = EmbeddingConfig {
            credentials_file: Some(path.clone()),
            access_token: Some("stale".to_string()),
            ..EmbeddingConfig::default()
        };
        let provider = GoogleEmbeddingProvider::from_config(&config).expect("provider builds");
        match &provider.auth {
            GoogleAuth::Vertex {
                project_id,
                credentials,
                ..
            } => {
                assert_eq!(project_id, "key-project");
                assert!(matches!(credentials, VertexCredentials::ServiceAccount(_)));
            }
            GoogleAuth::ApiKey(_) => panic!("expected vertex auth"),
        }

        let config = EmbeddingConfig {
            credentials_file: Some(path),
            project_id: Some("configured".to_string()),
            ..EmbeddingConfig::default()
        };
        let provider = GoogleEmbeddingProvider::from_config(&config).expect("provider builds");
        assert!(matches!(
            &provider.auth,
            GoogleAuth::Vertex { project_id, .. } if project_id == "configured"
        ));

        let config = EmbeddingConfig {
            credentials_file: Some(dir.path().join("missing.json")),
            api_key: Some("key".to_string()),
            ..EmbeddingConfig::default()
        };
        assert!(GoogleEmbeddingProvider::from_config(&config).is_err());
    }
}
