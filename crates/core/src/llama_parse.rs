//! Layout-aware PDF parsing through the LlamaParse job API: upload, poll, then
//! fetch per-page markdown.

use crate::config::LoaderConfig;
use crate::error::IngestError;
use crate::models::ParserKind;
use crate::traits::{PageExtractor, PageText};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_INSTRUCTION: &str = "This is an educational textbook containing text, images, tables and \
diagrams. Extract every table completely as markdown, keep all diacritics, preserve the chapter and \
section hierarchy, lists and exercises, transcribe formulas and units exactly, and describe diagrams \
that carry educational content.";

#[derive(Debug, Clone, Deserialize)]
struct JobResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct JobResult {
    #[serde(default)]
    pages: Vec<JobPage>,
}

#[derive(Debug, Clone, Deserialize)]
struct JobPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    md: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

pub struct LlamaParseExtractor {
    client: Client,
    base_url: Url,
    api_key: String,
    language: String,
    premium_mode: bool,
    instruction: String,
    timeout: Duration,
    poll_interval: Duration,
    max_bytes: u64,
    failed: Mutex<HashSet<PathBuf>>,
}

impl LlamaParseExtractor {
    /// `None` when no API key is configured; PDFs then go straight to the
    /// basic parser.
    pub fn from_config(config: &LoaderConfig) -> Result<Option<Self>, IngestError> {
        let Some(api_key) = config
            .llama_parse_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        else {
            return Ok(None);
        };

        let base_url = Url::parse(&config.llama_parse_base_url).map_err(|error| {
            IngestError::InvalidArgument(format!(
                "invalid LlamaParse url {}: {error}",
                config.llama_parse_base_url
            ))
        })?;

        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;

        Ok(Some(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            language: config.pdf_language.clone(),
            premium_mode: config.premium_mode,
            instruction: config
                .parsing_instruction
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string()),
            timeout: config.llama_parse_timeout,
            poll_interval: config.llama_parse_poll_interval,
            max_bytes: config.max_pdf_size_mb.saturating_mul(1024 * 1024),
            failed: Mutex::new(HashSet::new()),
        }))
    }

    /// Files that failed once are not sent again during this process.
    pub fn failed_files(&self) -> Vec<PathBuf> {
        let mut files = self
            .failed
            .lock()
            .map(|failed| failed.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        files.sort();
        files
    }

    pub fn clear_failed_files(&self) {
        if let Ok(mut failed) = self.failed.lock() {
            failed.clear();
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, IngestError> {
        self.base_url
            .join(path)
            .map_err(|error| IngestError::InvalidArgument(format!("invalid LlamaParse path {path}: {error}")))
    }

    async fn parse(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let job = self.upload(path).await?;
        info!(path = %path.display(), job = %job, "LlamaParse job submitted");
        self.wait_for(path, &job).await?;
        let result: JobResult = self
            .get(path, &format!("/api/parsing/job/{job}/result/json"))
            .await?;
        job_pages(result, path)
    }

    async fn upload(&self, path: &Path) -> Result<String, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")?;
        let form = Form::new()
            .part("file", part)
            .text("language", self.language.clone())
            .text("premium_mode", self.premium_mode.to_string())
            .text("parsing_instruction", self.instruction.clone());

        let response = self
            .client
            .post(self.endpoint("/api/parsing/upload")?)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let job: JobResponse = read_json(response, path).await?;
        Ok(job.id)
    }

    async fn wait_for(&self, path: &Path, job: &str) -> Result<(), IngestError> {
        let started = Instant::now();

        loop {
            let status: JobResponse = self.get(path, &format!("/api/parsing/job/{job}")).await?;
            match status.status.as_deref().unwrap_or("PENDING") {
                "SUCCESS" => return Ok(()),
                "PENDING" | "IN_PROGRESS" => {
                    debug!(path = %path.display(), job = %status.id, "LlamaParse job pending");
                }
                other => {
                    return Err(IngestError::parse(
                        path.display().to_string(),
                        format!("LlamaParse job {job} ended with status {other}"),
                    ))
                }
            }

            if started.elapsed() >= self.timeout {
                return Err(IngestError::parse(
                    path.display().to_string(),
                    format!("LlamaParse job {job} timed out after {:?}", self.timeout),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &Path, endpoint: &str) -> Result<T, IngestError> {
        let response = self
            .client
            .get(self.endpoint(endpoint)?)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        read_json(response, path).await
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    path: &Path,
) -> Result<T, IngestError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(IngestError::parse(
            path.display().to_string(),
            describe_status(status, &body),
        ));
    }
    Ok(response.json().await?)
}

fn describe_status(status: StatusCode, body: &str) -> String {
    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "credential rejected",
        StatusCode::TOO_MANY_REQUESTS => "rate limit or quota exceeded",
        StatusCode::PAYLOAD_TOO_LARGE => "file too large",
        _ => "request failed",
    };
    let body = body.chars().take(200).collect::<String>();
    format!("LlamaParse {reason} ({status}): {body}")
}

fn job_pages(result: JobResult, path: &Path) -> Result<Vec<PageText>, IngestError> {
    let pages = result
        .pages
        .into_iter()
        .enumerate()
        .filter_map(|(index, page)| {
            let text = page
                .md
                .filter(|md| !md.trim().is_empty())
                .or(page.text)?
                .trim()
                .to_string();
            if text.is_empty() {
                None
            } else {
                Some(PageText {
                    number: page.page.unwrap_or(index as u32 + 1),
                    text,
                })
            }
        })
        .collect::<Vec<_>>();

    if pages.is_empty() {
        return Err(IngestError::parse(
            path.display().to_string(),
            "LlamaParse returned no readable pages",
        ));
    }

    Ok(pages)
}

#[async_trait]
impl PageExtractor for LlamaParseExtractor {
    fn kind(&self) -> ParserKind {
        ParserKind::LlamaParse
    }

    fn accepts(&self, path: &Path) -> bool {
        let previously_failed = self
            .failed
            .lock()
            .map(|failed| failed.contains(path))
            .unwrap_or(false);
        if previously_failed {
            info!(path = %path.display(), "skipping LlamaParse for a file that already failed");
            return false;
        }

        match std::fs::metadata(path) {
            Ok(metadata) if metadata.len() > self.max_bytes => {
                warn!(
                    path = %path.display(),
                    size_mb = metadata.len() / (1024 * 1024),
                    "pdf too large for LlamaParse, using the basic parser"
                );
                false
            }
            _ => true,
        }
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let result = self.parse(path).await;
        if result.is_err() {
            if let Ok(mut failed) = self.failed.lock() {
                failed.insert(path.to_path_buf());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key(key: Option<&str>) -> LoaderConfig {
        LoaderConfig {
            llama_parse_api_key: key.map(str::to_string),
            ..LoaderConfig::default()
        }
    }

    #[test]
    fn missing_key_disables_the_advanced_parser() {
        assert!(LlamaParseExtractor::from_config(&config_with_key(None))
            .expect("config is valid")
            .is_none());
        assert!(LlamaParseExtractor::from_config(&config_with_key(Some("  ")))
            .expect("config is valid")
            .is_none());
    }

    #[test]
    fn job_result_prefers_markdown_and_skips_blank_pages() {
        let result: JobResult = serde_json::from_str(
            r##"{"pages":[
                {"page":1,"md":"  ","text":"plain one"},
                {"page":2,"md":"# Two","text":"two"},
                {"md":"   "}
            ]}"##,
        )
        .expect("valid json");

        let pages = job_pages(result, Path::new("x.pdf")).expect("pages parse");
        assert_eq!(
            pages,
            vec![
                PageText { number: 1, text: "plain one".to_string() },
                PageText { number: 2, text: "# Two".to_string() },
            ]
        );
    }

    #[test]
    fn empty_job_result_is_a_parse_failure() {
        let result = JobResult { pages: Vec::new() };
        assert!(matches!(
            job_pages(result, Path::new("x.pdf")),
            Err(IngestError::ParseFailure { .. })
        ));
    }

    #[tokio::test]
    async fn failed_files_are_not_retried() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.4")?;

        let mut config = config_with_key(Some("key"));
        config.llama_parse_base_url = "http://127.0.0.1:9".to_string();
        let parser = LlamaParseExtractor::from_config(&config)?.expect("parser is enabled");

        assert!(parser.accepts(&path));
        assert!(parser.extract_pages(&path).await.is_err());
        assert!(!parser.accepts(&path));
        assert_eq!(parser.failed_files(), vec![path.clone()]);

        parser.clear_failed_files();
        assert!(parser.accepts(&path));
        Ok(())
    }

    #[test]
    fn oversized_files_are_declined() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.pdf");
        std::fs::write(&path, vec![0u8; 2 * 1024 * 1024])?;

        let mut config = config_with_key(Some("key"));
        config.max_pdf_size_mb = 1;
        let parser = LlamaParseExtractor::from_config(&config)?.expect("parser is enabled");
        assert!(!parser.accepts(&path));
        Ok(())
    }
}
