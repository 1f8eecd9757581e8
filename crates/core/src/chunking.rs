use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::models::{Chunk, ChunkMetadata, CleanedDocument};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Char-offset range of one chunk. `overlap` leading chars repeat the tail of
/// the previous chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
}

impl ChunkSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
}

impl Boundary {
    const HIERARCHY: [Boundary; 3] = [Boundary::Paragraph, Boundary::Sentence, Boundary::Word];

    /// Whether a chunk may end right before `chars[end]`.
    fn allows_cut(self, chars: &[char], end: usize) -> bool {
        if end == 0 {
            return false;
        }
        let last = chars[end - 1];
        let before = end.checked_sub(2).map(|index| chars[index]);

        match self {
            Boundary::Paragraph => last == '\n' && before == Some('\n'),
            Boundary::Sentence => {
                last == '\n'
                    || (last.is_whitespace()
                        && before.is_some_and(|c| matches!(c, '.' | '!' | '?' | '…' | '。')))
            }
            Boundary::Word => last.is_whitespace(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Result<Self, IngestError> {
        if config.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chars must be positive".to_string(),
            ));
        }
        if config.overlap_chars >= config.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than max {}",
                config.overlap_chars, config.max_chars
            )));
        }
        if let Some(parent) = config.parent_max_chars {
            if parent <= config.max_chars {
                return Err(IngestError::InvalidChunkConfig(format!(
                    "parent size {parent} must exceed chunk size {}",
                    config.max_chars
                )));
            }
        }
        Ok(Self { config: *config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Splits `text` into spans of at most `max_chars` characters. Each cut is
    /// placed at the coarsest boundary found in the window: paragraph, then
    /// sentence, then word, and a hard cut at the limit when none exists.
    pub fn split(&self, text: &str) -> Vec<ChunkSpan> {
        let chars: Vec<char> = text.chars().collect();
        self.split_chars(&chars)
    }

    fn split_chars(&self, chars: &[char]) -> Vec<ChunkSpan> {
        split_spans(chars, self.config.max_chars, self.config.overlap_chars)
    }

    pub fn chunk_document(&self, document: &CleanedDocument) -> Vec<Chunk> {
        let chars: Vec<char> = document.content.chars().collect();
        let mut extra = document.metadata.extra.clone();
        extra.insert(
            "parser".to_string(),
            serde_json::to_value(document.metadata.parser).unwrap_or(Value::Null),
        );
        extra.insert(
            "loaded_at".to_string(),
            Value::String(document.metadata.loaded_at.to_rfc3339()),
        );

        let Some(parent_max) = self.config.parent_max_chars else {
            return self
                .split_chars(&chars)
                .into_iter()
                .enumerate()
                .map(|(ordinal, span)| build_chunk(document, &chars, ordinal, span, extra.clone()))
                .collect();
        };

        // Children are cut inside each parent. Offsets stay document-absolute.
        let mut chunks = Vec::new();
        let parents = split_spans(&chars, parent_max, self.config.overlap_chars);
        for (parent_index, parent) in parents.into_iter().enumerate() {
            let parent_chars = &chars[parent.start..parent.end];
            let parent_id = make_parent_id(&document.id, parent_index as u32);
            let parent_text: String = parent_chars.iter().collect();

            for (child_index, child) in self.split_chars(parent_chars).into_iter().enumerate() {
                let span = ChunkSpan {
                    start: parent.start + child.start,
                    end: parent.start + child.end,
                    overlap: if child_index == 0 {
                        parent.overlap
                    } else {
                        child.overlap
                    },
                };
                let mut extra = extra.clone();
                extra.insert("chunk_type".to_string(), Value::from("child"));
                extra.insert("parent_id".to_string(), Value::from(parent_id.clone()));
                extra.insert("parent_index".to_string(), Value::from(parent_index));
                extra.insert("parent_text".to_string(), Value::from(parent_text.clone()));
                extra.insert("child_index".to_string(), Value::from(child_index));
                chunks.push(build_chunk(document, &chars, chunks.len(), span, extra));
            }
        }
        chunks
    }

    pub fn chunk_documents(&self, documents: &[CleanedDocument]) -> Vec<Chunk> {
        documents
            .iter()
            .flat_map(|document| self.chunk_document(document))
            .collect()
    }
}

fn split_spans(chars: &[char], max: usize, overlap: usize) -> Vec<ChunkSpan> {
    let len = chars.len();
    let mut spans = Vec::new();

    if len == 0 {
        return spans;
    }

    let mut start = 0usize;
    loop {
        let leading = if spans.is_empty() { 0 } else { overlap };

        if len - start <= max {
            spans.push(ChunkSpan {
                start,
                end: len,
                overlap: leading,
            });
            break;
        }

        // The cut must leave the next chunk something new after its overlap.
        let end = find_cut(chars, start + overlap, start + max);
        spans.push(ChunkSpan {
            start,
            end,
            overlap: leading,
        });
        start = end - overlap;
    }

    spans
}

fn build_chunk(
    document: &CleanedDocument,
    chars: &[char],
    ordinal: usize,
    span: ChunkSpan,
    extra: BTreeMap<String, Value>,
) -> Chunk {
    let ordinal = ordinal as u32;
    Chunk {
        id: make_chunk_id(&document.id, ordinal),
        text: chars[span.start..span.end].iter().collect(),
        metadata: ChunkMetadata {
            document_id: document.id.clone(),
            source_file: document.metadata.source_file.clone(),
            file_path: document.metadata.file_path.clone(),
            format: document.metadata.format,
            page: document.metadata.page,
            chunk_ordinal: ordinal,
            start_char: span.start,
            end_char: span.end,
            overlap_chars: span.overlap,
            extra,
        },
    }
}

fn find_cut(chars: &[char], lower_exclusive: usize, upper: usize) -> usize {
    for boundary in Boundary::HIERARCHY {
        if let Some(end) = (lower_exclusive + 1..=upper)
            .rev()
            .find(|end| boundary.allows_cut(chars, *end))
        {
            return end;
        }
    }
    upper
}

/// Identity depends only on the document and the ordinal, so re-ingesting the
/// same source overwrites its records.
pub fn make_chunk_id(document_id: &str, ordinal: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn make_parent_id(document_id: &str, index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b"\0parent\0");
    hasher.update(index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rebuilds a document's cleaned text from its chunks, dropping each declared
/// leading overlap.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut ordered = chunks.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|chunk| chunk.metadata.chunk_ordinal);
    ordered.iter().map(|chunk| chunk.fresh_text()).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkStats {
    pub count: usize,
    pub min_chars: usize,
    pub max_chars: usize,
    pub avg_chars: usize,
}

impl ChunkStats {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        if chunks.is_empty() {
            return Self::default();
        }
        let sizes = chunks.iter().map(Chunk::char_len).collect::<Vec<_>>();
        Self {
            count: sizes.len(),
            min_chars: sizes.iter().copied().min().unwrap_or_default(),
            max_chars: sizes.iter().copied().max().unwrap_or_default(),
            avg_chars: sizes.iter().sum::<usize>() / sizes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentFormat, DocumentMetadata, ParserKind};
    use chrono::Utc;

    fn chunker(max_chars: usize, overlap_chars: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_chars,
            overlap_chars,
            parent_max_chars: None,
        })
        .expect("valid chunking config")
    }

    fn cleaned(content: &str) -> CleanedDocument {
        CleanedDocument {
            id: "doc-1".to_string(),
            source: "/tmp/x.txt".to_string(),
            content: content.to_string(),
            metadata: DocumentMetadata {
                format: DocumentFormat::Text,
                source_file: "x.txt".to_string(),
                file_path: "/tmp/x.txt".to_string(),
                loaded_at: Utc::now(),
                page: None,
                parser: ParserKind::PlainText,
                extra: BTreeMap::new(),
            },
        }
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for paragraph in 0..12 {
            for sentence in 0..(paragraph % 4 + 2) {
                text.push_str(&format!(
                    "Paragraph {paragraph} sentence {sentence} talks about cách học toán. "
                ));
            }
            text.push_str("\n\n");
        }
        text.push_str(&"x".repeat(700));
        text
    }

    #[test]
    fn boundary_free_text_uses_fixed_windows() {
        let spans = chunker(1000, 200).split(&"a".repeat(2500));
        assert_eq!(
            spans,
            vec![
                ChunkSpan { start: 0, end: 1000, overlap: 0 },
                ChunkSpan { start: 800, end: 1800, overlap: 200 },
                ChunkSpan { start: 1600, end: 2500, overlap: 200 },
            ]
        );
    }

    #[test]
    fn every_chunk_respects_the_maximum() {
        let text = sample_text();
        for (max, overlap) in [(40, 0), (80, 10), (150, 60), (1000, 200), (7, 3)] {
            let chunks = chunker(max, overlap).chunk_document(&cleaned(&text));
            assert!(!chunks.is_empty());
            assert!(chunks.iter().all(|chunk| chunk.char_len() <= max));
        }
    }

    #[test]
    fn reconstruction_reproduces_cleaned_text() {
        let text = sample_text();
        for (max, overlap) in [(40, 0), (80, 10), (150, 60), (1000, 200), (7, 3)] {
            let chunks = chunker(max, overlap).chunk_document(&cleaned(&text));
            assert_eq!(reconstruct(&chunks), text, "max={max} overlap={overlap}");
        }
    }

    #[test]
    fn consecutive_chunks_share_the_configured_overlap() {
        let text = sample_text();
        let chunks = chunker(150, 30).chunk_document(&cleaned(&text));
        assert_eq!(chunks[0].metadata.overlap_chars, 0);

        for pair in chunks.windows(2) {
            let previous: Vec<char> = pair[0].text.chars().collect();
            let tail: String = previous[previous.len() - 30..].iter().collect();
            let head: String = pair[1].text.chars().take(30).collect();
            assert_eq!(pair[1].metadata.overlap_chars, 30);
            assert_eq!(tail, head);
            assert_eq!(pair[1].metadata.start_char, pair[0].metadata.end_char - 30);
        }
    }

    #[test]
    fn cuts_prefer_paragraph_then_sentence_boundaries() {
        let text = "First paragraph here.\n\nSecond one. It has two sentences and more words";
        let spans = chunker(40, 0).split(text);
        assert_eq!(spans[0].end, "First paragraph here.\n\n".chars().count());

        let text = "One sentence. Another sentence that keeps going on";
        let spans = chunker(30, 0).split(text);
        assert_eq!(spans[0].end, "One sentence. ".chars().count());
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = sample_text();
        let first = chunker(120, 20).chunk_document(&cleaned(&text));
        let second = chunker(120, 20).chunk_document(&cleaned(&text));
        let ids = |chunks: &[Chunk]| chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(
            first.iter().map(|c| &c.text).collect::<Vec<_>>(),
            second.iter().map(|c| &c.text).collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(chunker(100, 10).chunk_document(&cleaned("")).is_empty());
    }

    #[test]
    fn overlap_must_be_smaller_than_maximum() {
        let result = Chunker::new(&ChunkingConfig {
            max_chars: 10,
            overlap_chars: 10,
            parent_max_chars: None,
        });
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn chunk_identity_depends_on_document_and_ordinal() {
        assert_eq!(make_chunk_id("doc", 1), make_chunk_id("doc", 1));
        assert_ne!(make_chunk_id("doc", 1), make_chunk_id("doc", 2));
        assert_ne!(make_chunk_id("doc", 1), make_chunk_id("other", 1));
    }

    fn hierarchical(max_chars: usize, overlap_chars: usize, parent: usize) -> Chunker {
        Chunker::new(&ChunkingConfig {
            max_chars,
            overlap_chars,
            parent_max_chars: Some(parent),
        })
        .expect("valid hierarchical config")
    }

    #[test]
    fn children_carry_their_parent_context() {
        let text = sample_text();
        let chunks = hierarchical(120, 20, 400).chunk_document(&cleaned(&text));
        assert!(!chunks.is_empty());

        for chunk in &chunks {
            assert!(chunk.char_len() <= 120);
            assert_eq!(chunk.metadata.extra["chunk_type"], "child");
            let parent_text = chunk.metadata.extra["parent_text"]
                .as_str()
                .expect("parent text is a string");
            assert!(parent_text.chars().count() <= 400);
            assert!(parent_text.contains(&chunk.text));
        }

        let parents = chunks
            .iter()
            .filter_map(|chunk| chunk.metadata.extra["parent_id"].as_str())
            .collect::<std::collections::BTreeSet<_>>();
        assert!(parents.len() > 1);
        assert_eq!(chunks[0].metadata.extra["child_index"], 0);
    }

    #[test]
    fn hierarchical_chunks_still_reconstruct_the_document() {
        let text = sample_text();
        for (max, overlap, parent) in [(120, 20, 400), (50, 0, 200), (80, 30, 81)] {
            let chunks = hierarchical(max, overlap, parent).chunk_document(&cleaned(&text));
            assert_eq!(reconstruct(&chunks), text, "max={max} parent={parent}");
            for pair in chunks.windows(2) {
                assert_eq!(
                    pair[1].metadata.start_char,
                    pair[0].metadata.end_char - pair[1].metadata.overlap_chars
                );
            }
            let ids = chunks.iter().map(|c| c.id.clone()).collect::<std::collections::BTreeSet<_>>();
            assert_eq!(ids.len(), chunks.len());
        }
    }

    #[test]
    fn parent_must_exceed_child_size() {
        let result = Chunker::new(&ChunkingConfig {
            max_chars: 100,
            overlap_chars: 10,
            parent_max_chars: Some(100),
        });
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }
}
