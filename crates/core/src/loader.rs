use crate::catalog::CatalogParser;
use crate::config::LoaderConfig;
use crate::error::IngestError;
use crate::extractor::{
    DocxExtractor, ExtractionChain, LopdfExtractor, MarkdownExtractor, PlainTextExtractor,
};
use crate::llama_parse::LlamaParseExtractor;
use crate::models::{Document, DocumentFormat, DocumentMetadata};
use crate::traits::PageExtractor;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub files_seen: usize,
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Files found under a source root, plus entries the walk could not read.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<PathBuf>,
    pub unreadable: Vec<SkippedFile>,
}

/// Lists regular, non-hidden files under `root` in a stable order. A file
/// path is returned as-is. Symlinks are followed; dangling links and loops
/// land in `unreadable`.
pub fn discover_files(root: &Path, recursive: bool) -> Result<Discovery, IngestError> {
    if root.is_file() {
        return Ok(Discovery {
            files: vec![root.to_path_buf()],
            unreadable: Vec::new(),
        });
    }
    if !root.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "source not found: {}",
            root.display()
        )));
    }

    let mut walker = WalkDir::new(root).follow_links(true);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut discovery = Discovery::default();
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(error) => {
                let path = error.path().unwrap_or(root).to_path_buf();
                warn!(path = %path.display(), %error, "unreadable entry");
                discovery.unreadable.push(SkippedFile {
                    path,
                    reason: format!("unreadable: {error}"),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let hidden = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'));
        if !hidden {
            discovery.files.push(entry.path().to_path_buf());
        }
    }

    discovery.files.sort_unstable();
    discovery.unreadable.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(discovery)
}

pub fn generate_document_id(source: &str, page: Option<u32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    if let Some(page) = page {
        hasher.update(b"#page=");
        hasher.update(page.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Format-dispatching loader. PDFs go through the advanced parser first when
/// one is configured and fall back to the basic text layer.
pub struct DocumentLoader {
    config: LoaderConfig,
    pdf: ExtractionChain,
    text: ExtractionChain,
    markdown: ExtractionChain,
    docx: ExtractionChain,
    advanced: Option<Arc<LlamaParseExtractor>>,
    catalog: Option<CatalogParser>,
}

impl DocumentLoader {
    pub fn new(config: &LoaderConfig) -> Result<Self, IngestError> {
        let advanced = LlamaParseExtractor::from_config(config)?.map(Arc::new);
        let pdf = match &advanced {
            Some(parser) => {
                let advanced: Arc<dyn PageExtractor> = parser.clone();
                ExtractionChain::new(vec![advanced, Arc::new(LopdfExtractor)])
            }
            None => {
                info!("no LlamaParse key configured, PDFs use the basic parser only");
                ExtractionChain::single(Arc::new(LopdfExtractor))
            }
        };
        let catalog = if config.filename_metadata {
            Some(CatalogParser::new()?)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            pdf,
            text: ExtractionChain::single(Arc::new(PlainTextExtractor)),
            markdown: ExtractionChain::single(Arc::new(MarkdownExtractor)),
            docx: ExtractionChain::single(Arc::new(DocxExtractor)),
            advanced,
            catalog,
        })
    }

    /// Replaces the PDF strategy chain.
    pub fn with_pdf_chain(mut self, chain: ExtractionChain) -> Self {
        self.pdf = chain;
        self
    }

    fn chain(&self, format: DocumentFormat) -> &ExtractionChain {
        match format {
            DocumentFormat::Pdf => &self.pdf,
            DocumentFormat::Text => &self.text,
            DocumentFormat::Markdown => &self.markdown,
            DocumentFormat::Docx => &self.docx,
        }
    }

    pub fn failed_advanced_files(&self) -> Vec<PathBuf> {
        self.advanced
            .as_ref()
            .map(|parser| parser.failed_files())
            .unwrap_or_default()
    }

    pub fn discover(&self, root: &Path) -> Result<Discovery, IngestError> {
        discover_files(root, self.config.recursive)
    }

    /// All documents of one file: one per page for PDFs, one otherwise.
    pub async fn load_file(&self, path: &Path) -> Result<Vec<Document>, IngestError> {
        let format = DocumentFormat::from_path(path)?;
        let source_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let source = absolute.to_string_lossy().to_string();

        let (parser, pages) = self.chain(format).extract(path).await?;
        let extra = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.parse(path))
            .map(|entry| entry.into_metadata())
            .unwrap_or_default();
        let loaded_at = Utc::now();

        let documents = pages
            .into_iter()
            .filter(|page| !page.text.trim().is_empty())
            .map(|page| {
                let page_number = (format == DocumentFormat::Pdf).then_some(page.number);
                Document {
                    id: generate_document_id(&source, page_number),
                    source: source.clone(),
                    content: page.text,
                    metadata: DocumentMetadata {
                        format,
                        source_file: source_file.clone(),
                        file_path: source.clone(),
                        loaded_at,
                        page: page_number,
                        parser,
                        extra: extra.clone(),
                    },
                }
            })
            .collect::<Vec<_>>();

        debug!(path = %path.display(), ?parser, documents = documents.len(), "file loaded");
        Ok(documents)
    }

    /// Loads every file under `root`. Individual files that cannot be loaded
    /// are reported and skipped; only an unreadable root fails the call.
    pub async fn load_path(&self, root: &Path) -> Result<LoadReport, IngestError> {
        let Discovery { files, unreadable } = self.discover(root)?;
        let mut report = LoadReport {
            files_seen: files.len() + unreadable.len(),
            skipped_files: unreadable,
            ..LoadReport::default()
        };

        for path in files {
            match self.load_file(&path).await {
                Ok(documents) => report.documents.extend(documents),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping file");
                    report.skipped_files.push(SkippedFile {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}
