use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    #[serde(rename = "txt")]
    Text,
    #[serde(rename = "md")]
    Markdown,
    Docx,
}

impl DocumentFormat {
    pub const SUPPORTED_EXTENSIONS: [&'static str; 4] = ["pdf", "txt", "md", "docx"];

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Text),
            "md" | "markdown" => Some(Self::Markdown),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();

        Self::from_extension(extension).ok_or_else(|| IngestError::UnsupportedFormat {
            path: path.display().to_string(),
            extension: extension.to_string(),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Text => "txt",
            Self::Markdown => "md",
            Self::Docx => "docx",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which extraction strategy produced a document's text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    LlamaParse,
    Lopdf,
    PlainText,
    Markdown,
    Docx,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    pub format: DocumentFormat,
    pub source_file: String,
    pub file_path: String,
    pub loaded_at: DateTime<Utc>,
    pub page: Option<u32>,
    pub parser: ParserKind,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Raw text produced by the loader. One per text file, one per page for PDFs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// A document after the cleaning transforms. Identity and metadata are the
/// source document's.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedDocument {
    pub id: String,
    pub source: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl From<Document> for CleanedDocument {
    fn from(value: Document) -> Self {
        Self {
            id: value.id,
            source: value.source,
            content: value.content,
            metadata: value.metadata,
        }
    }
}

/// Filterable chunk metadata: well-known keys plus the document's open
/// extension map, flattened into one JSON object on the way to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub source_file: String,
    pub file_path: String,
    pub format: DocumentFormat,
    pub page: Option<u32>,
    pub chunk_ordinal: u32,
    pub start_char: usize,
    pub end_char: usize,
    pub overlap_chars: usize,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// The part of this chunk not shared with its predecessor.
    pub fn fresh_text(&self) -> String {
        self.text.chars().skip(self.metadata.overlap_chars).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub values: Vec<f32>,
    pub model: String,
}

impl EmbeddingVector {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    InnerProduct,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::InnerProduct => "inner_product",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Some(Self::Cosine),
            "euclidean" | "l2" => Some(Self::Euclidean),
            "inner_product" | "ip" | "dot" => Some(Self::InnerProduct),
            _ => None,
        }
    }

    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Self::Euclidean)
    }

    /// Score reported to callers: cosine similarity, L2 distance, or dot product.
    pub fn score(&self, left: &[f32], right: &[f32]) -> f64 {
        match self {
            Self::Cosine => {
                let dot = dot(left, right);
                let norms = norm(left) * norm(right);
                if norms == 0.0 {
                    0.0
                } else {
                    dot / norms
                }
            }
            Self::Euclidean => left
                .iter()
                .zip(right)
                .map(|(a, b)| {
                    let delta = f64::from(*a) - f64::from(*b);
                    delta * delta
                })
                .sum::<f64>()
                .sqrt(),
            Self::InnerProduct => dot(left, right),
        }
    }

    /// Ascending key: smaller sorts first regardless of metric.
    pub fn rank_key(&self, score: f64) -> f64 {
        if self.higher_is_better() {
            -score
        } else {
            score
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn dot(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum()
}

fn norm(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
        .sqrt()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectionState {
    Absent,
    Created,
    Populated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionInfo {
    pub id: String,
    pub name: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionStats {
    pub name: String,
    pub state: CollectionState,
    pub record_count: u64,
    pub dimension: Option<usize>,
    pub metric: Option<DistanceMetric>,
}

/// One row of the records table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    pub embedding: Vec<f32>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchInput {
    Text(String),
    Vector(Vec<f32>),
}

impl From<&str> for SearchInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<f32>> for SearchInput {
    fn from(value: Vec<f32>) -> Self {
        Self::Vector(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Equals(Value),
    /// JSON containment: array membership, sub-object, or scalar equality.
    Contains(Value),
}

/// Conjunction of per-field conditions over chunk metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataFilter {
    pub conditions: BTreeMap<String, FilterCondition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .insert(field.into(), FilterCondition::Equals(value.into()));
        self
    }

    pub fn contains(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .insert(field.into(), FilterCondition::Contains(value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, metadata: &Value) -> bool {
        let Some(object) = metadata.as_object() else {
            return self.is_empty();
        };

        self.conditions.iter().all(|(field, condition)| {
            let Some(actual) = object.get(field) else {
                return false;
            };
            match condition {
                FilterCondition::Equals(expected) => json_equals(actual, expected),
                FilterCondition::Contains(expected) => json_contains(actual, expected),
            }
        })
    }
}

/// Mirrors Postgres `jsonb =`: numbers compare by value, so `2` equals `2.0`.
pub fn json_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) if a.is_f64() || b.is_f64() => {
            a.as_f64() == b.as_f64()
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, value)| b.get(key).is_some_and(|other| json_equals(value, other)))
        }
        (a, b) => a == b,
    }
}

/// Mirrors Postgres `jsonb @>` so both backends filter identically.
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(outer), Value::Object(inner)) => inner.iter().all(|(key, value)| {
            outer
                .get(key)
                .is_some_and(|candidate| json_contains(candidate, value))
        }),
        (Value::Array(outer), Value::Array(inner)) => inner
            .iter()
            .all(|value| outer.iter().any(|candidate| json_contains(candidate, value))),
        (Value::Array(outer), scalar) if !scalar.is_object() => {
            outer.iter().any(|candidate| json_equals(candidate, scalar))
        }
        (left, right) => json_equals(left, right),
    }
}

pub fn metadata_object(metadata: &ChunkMetadata) -> Result<Value, serde_json::Error> {
    let value = serde_json::to_value(metadata)?;
    Ok(match value {
        Value::Object(map) => Value::Object(map),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    })
}
