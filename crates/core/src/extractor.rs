use crate::error::IngestError;
use crate::models::ParserKind;
use crate::traits::{PageExtractor, PageText};
use async_trait::async_trait;
use lopdf::Document as PdfDocument;
use pulldown_cmark::{Event, Parser, TagEnd};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Basic PDF text layer extraction, one page per entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

#[async_trait]
impl PageExtractor for LopdfExtractor {
    fn kind(&self) -> ParserKind {
        ParserKind::Lopdf
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || extract_pdf_pages(&owned))
            .await
            .map_err(|error| IngestError::parse(path.display().to_string(), error.to_string()))?
    }
}

fn extract_pdf_pages(path: &Path) -> Result<Vec<PageText>, IngestError> {
    let parse_error = |error: lopdf::Error| IngestError::parse(path.display().to_string(), error.to_string());
    let document = PdfDocument::load(path).map_err(parse_error)?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document.extract_text(&[page_no]).map_err(parse_error)?;

        if !text.trim().is_empty() {
            pages.push(PageText {
                number: page_no,
                text,
            });
        }
    }

    if pages.is_empty() {
        return Err(IngestError::parse(
            path.display().to_string(),
            "pdf had no readable page text",
        ));
    }

    Ok(pages)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl PageExtractor for PlainTextExtractor {
    fn kind(&self) -> ParserKind {
        ParserKind::PlainText
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(vec![PageText {
            number: 1,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        }])
    }
}

/// Markdown rendered down to its text, one paragraph per block element.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownExtractor;

#[async_trait]
impl PageExtractor for MarkdownExtractor {
    fn kind(&self) -> ParserKind {
        ParserKind::Markdown
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let source = String::from_utf8_lossy(&bytes);
        Ok(vec![PageText {
            number: 1,
            text: markdown_to_text(&source),
        }])
    }
}

pub fn markdown_to_text(source: &str) -> String {
    let mut output = String::new();

    for event in Parser::new(source) {
        match event {
            Event::Text(text) | Event::Code(text) => output.push_str(&text),
            Event::SoftBreak | Event::HardBreak => output.push('\n'),
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::Item) => output.push_str("\n\n"),
            _ => {}
        }
    }

    output.trim().to_string()
}

/// Paragraph text from `word/document.xml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxExtractor;

#[async_trait]
impl PageExtractor for DocxExtractor {
    fn kind(&self) -> ParserKind {
        ParserKind::Docx
    }

    async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let text = docx_text(&bytes, path)?;
        Ok(vec![PageText { number: 1, text }])
    }
}

fn docx_text(bytes: &[u8], path: &Path) -> Result<String, IngestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")?
        .read_to_string(&mut xml)?;
    docx_paragraphs(&xml).map_err(|reason| IngestError::parse(path.display().to_string(), reason))
}

fn docx_paragraphs(xml: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(element)) if element.local_name().as_ref() == b"t" => {
                in_text = true;
            }
            Ok(XmlEvent::Text(text)) if in_text => {
                let unescaped = text.unescape().map_err(|error| error.to_string())?;
                current.push_str(&unescaped);
            }
            Ok(XmlEvent::Empty(element)) => match element.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(XmlEvent::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim().to_string();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph);
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(XmlEvent::Eof) => break,
            Err(error) => return Err(error.to_string()),
            _ => {}
        }
    }

    Ok(paragraphs.join("\n\n"))
}

/// Strategies tried strictly in order; the first that accepts the file and
/// returns non-empty text wins.
#[derive(Clone)]
pub struct ExtractionChain {
    strategies: Vec<Arc<dyn PageExtractor>>,
}

impl ExtractionChain {
    pub fn new(strategies: Vec<Arc<dyn PageExtractor>>) -> Self {
        Self { strategies }
    }

    pub fn single(strategy: Arc<dyn PageExtractor>) -> Self {
        Self::new(vec![strategy])
    }

    pub fn kinds(&self) -> Vec<ParserKind> {
        self.strategies.iter().map(|strategy| strategy.kind()).collect()
    }

    pub async fn extract(&self, path: &Path) -> Result<(ParserKind, Vec<PageText>), IngestError> {
        let mut failures = Vec::new();

        for strategy in &self.strategies {
            if !strategy.accepts(path) {
                continue;
            }

            match strategy.extract_pages(path).await {
                Ok(pages) if pages.iter().any(|page| !page.text.trim().is_empty()) => {
                    return Ok((strategy.kind(), pages));
                }
                Ok(_) => {
                    warn!(path = %path.display(), parser = ?strategy.kind(), "parser returned no text, falling back");
                    failures.push(format!("{:?}: no text", strategy.kind()));
                }
                Err(error) => {
                    warn!(path = %path.display(), parser = ?strategy.kind(), %error, "parser failed, falling back");
                    failures.push(format!("{:?}: {error}", strategy.kind()));
                }
            }
        }

        Err(IngestError::parse(
            path.display().to_string(),
            if failures.is_empty() {
                "no parser accepted the file".to_string()
            } else {
                failures.join("; ")
            },
        ))
    }
}
