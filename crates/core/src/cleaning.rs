use crate::config::CleaningConfig;
use crate::error::IngestError;
use crate::models::{CleanedDocument, Document};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

const URL_PATTERN: &str = r"(?i)\b(?:https?://|ftp://|www\.)[^\s<>()\[\]]+";
const EMAIL_PATTERN: &str = r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b";

/// Collapses runs of horizontal whitespace, trims every line and keeps at most
/// one blank line between paragraphs.
pub fn normalize_whitespace(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut output = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.lines() {
        let collapsed = line
            .split(|c: char| c.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }

        if !output.is_empty() {
            output.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        output.push_str(&collapsed);
    }

    output
}

/// Lowercases and folds typographic punctuation and invisible characters to
/// their plain equivalents.
pub fn normalize_characters(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}' | '\u{ad}' => None,
            '\u{a0}' | '\u{2007}' | '\u{202f}' => Some(' '),
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{2032}' => Some('\''),
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{2033}' => Some('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2212}' => {
                Some('-')
            }
            '\u{2026}' => Some('.'),
            other => Some(other),
        })
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Ordered, individually toggleable text transforms. The order is fixed:
/// whitespace, URL/email removal, character normalization, then duplicate
/// removal across the corpus.
#[derive(Debug, Clone)]
pub struct Cleaner {
    config: CleaningConfig,
    url_re: Regex,
    email_re: Regex,
}

impl Cleaner {
    pub fn new(config: &CleaningConfig) -> Result<Self, IngestError> {
        Ok(Self {
            config: *config,
            url_re: Regex::new(URL_PATTERN)?,
            email_re: Regex::new(EMAIL_PATTERN)?,
        })
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    pub fn strip_urls_and_emails(&self, text: &str) -> String {
        let without_urls = self.url_re.replace_all(text, "");
        self.email_re.replace_all(&without_urls, "").into_owned()
    }

    /// Per-document transforms. Pure: identity and metadata are untouched.
    pub fn clean_document(&self, document: Document) -> CleanedDocument {
        let mut cleaned = CleanedDocument::from(document);
        let mut content = std::mem::take(&mut cleaned.content);

        if self.config.normalize_whitespace {
            content = normalize_whitespace(&content);
        }
        if self.config.strip_urls_and_emails {
            content = self.strip_urls_and_emails(&content);
            if self.config.normalize_whitespace {
                content = normalize_whitespace(&content);
            }
        }
        if self.config.normalize_characters {
            content = normalize_characters(&content);
        }

        cleaned.content = content;
        cleaned
    }

    pub fn session(&self) -> CleaningSession<'_> {
        CleaningSession {
            cleaner: self,
            seen: HashSet::new(),
            duplicates_removed: 0,
        }
    }

    /// Cleans a whole corpus in one go.
    pub fn clean_corpus(&self, documents: Vec<Document>) -> Vec<CleanedDocument> {
        let mut session = self.session();
        session.clean(documents)
    }
}

/// Carries the content-hash set so duplicate removal spans every file of a run.
pub struct CleaningSession<'a> {
    cleaner: &'a Cleaner,
    seen: HashSet<String>,
    duplicates_removed: usize,
}

impl CleaningSession<'_> {
    pub fn clean(&mut self, documents: Vec<Document>) -> Vec<CleanedDocument> {
        let mut output = Vec::with_capacity(documents.len());

        for document in documents {
            let cleaned = self.cleaner.clean_document(document);
            if cleaned.content.trim().is_empty() {
                debug!(document = %cleaned.id, "document is empty after cleaning");
                continue;
            }

            if self.cleaner.config.deduplicate && !self.seen.insert(content_hash(&cleaned.content))
            {
                debug!(document = %cleaned.id, "dropping duplicate document content");
                self.duplicates_removed += 1;
                continue;
            }

            output.push(cleaned);
        }

        output
    }

    pub fn duplicates_removed(&self) -> usize {
        self.duplicates_removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentFormat, DocumentMetadata, ParserKind};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn document(id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            source: format!("/tmp/{id}.txt"),
            content: content.to_string(),
            metadata: DocumentMetadata {
                format: DocumentFormat::Text,
                source_file: format!("{id}.txt"),
                file_path: format!("/tmp/{id}.txt"),
                loaded_at: Utc::now(),
                page: Some(2),
                parser: ParserKind::PlainText,
                extra: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn whitespace_is_normalized_but_paragraphs_survive() {
        let input = "A  \t  lot\nof   spacing\n\n\n\n  Next\u{a0}para  ";
        assert_eq!(normalize_whitespace(input), "A lot\nof spacing\n\nNext para");
    }

    #[test]
    fn urls_and_emails_are_removed_when_enabled() {
        let config = CleaningConfig {
            strip_urls_and_emails: true,
            ..CleaningConfig::default()
        };
        let cleaner = Cleaner::new(&config).expect("patterns compile");
        let cleaned = cleaner.clean_document(document(
            "a",
            "See https://example.com/x?y=1 or write to team@example.org today",
        ));
        assert_eq!(cleaned.content, "See or write to today");
    }

    #[test]
    fn character_normalization_lowercases_and_folds_quotes() {
        assert_eq!(
            normalize_characters("\u{201c}Tiếng Việt\u{201d} \u{2013} OK"),
            "\"tiếng việt\" - ok"
        );
    }

    #[test]
    fn transforms_keep_identity_and_metadata() {
        let cleaner = Cleaner::new(&CleaningConfig::default()).expect("patterns compile");
        let original = document("a", "  hello   world ");
        let cleaned = cleaner.clean_document(original.clone());
        assert_eq!(cleaned.id, original.id);
        assert_eq!(cleaned.metadata, original.metadata);
        assert_eq!(cleaned.content, "hello world");
    }

    #[test]
    fn duplicates_are_detected_after_normalization() {
        let cleaner = Cleaner::new(&CleaningConfig::default()).expect("patterns compile");
        let mut session = cleaner.session();
        let first = session.clean(vec![document("a", "same   text")]);
        let second = session.clean(vec![document("b", "same text\n"), document("c", "other")]);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "c");
        assert_eq!(session.duplicates_removed(), 1);
    }

    #[test]
    fn deduplication_can_be_disabled() {
        let config = CleaningConfig {
            deduplicate: false,
            ..CleaningConfig::default()
        };
        let cleaned = Cleaner::new(&config)
            .expect("patterns compile")
            .clean_corpus(vec![document("a", "x"), document("b", "x")]);
        assert_eq!(cleaned.len(), 2);
    }
}
