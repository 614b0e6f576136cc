//! Core records flowing through ingestion, the index and retrieval.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single metadata value attached to a document or chunk.
///
/// Serialized untagged so JSON and TOML metadata read naturally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; integers and floats compare on the same axis.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }

    /// Parse a loosely typed value from the command line or a filter expression.
    pub fn parse_loose(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Integer(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return Self::Float(f);
            }
        }
        match raw {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => Self::String(raw.to_string()),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<usize> for MetadataValue {
    fn from(i: usize) -> Self {
        Self::Integer(i as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A source document as handed to ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new<I: Into<String>, T: Into<String>>(document_id: I, text: T) -> Self {
        Self {
            document_id: document_id.into(),
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata<K: Into<String>, V: Into<MetadataValue>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A contiguous slice of a document, the unit that gets embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    /// Character offset, inclusive
    pub start_offset: usize,
    /// Character offset, exclusive
    pub end_offset: usize,
    pub text: String,
    pub metadata: Metadata,
}

/// Derive the stable identifier of a chunk.
///
/// Zero padding keeps lexicographic order equal to positional order.
pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{document_id}_chunk_{index:06}")
}

/// Metadata a chunk inherits from its document plus its own positional fields.
///
/// Chunk-local keys win over document keys of the same name.
pub fn inherited_metadata(
    parent: &Metadata,
    document_id: &str,
    chunk_index: usize,
    total_chunks: usize,
    start_offset: usize,
    end_offset: usize,
    indexed_at: DateTime<Utc>,
) -> Metadata {
    let mut metadata = parent.clone();
    metadata.insert("document_id".into(), document_id.into());
    metadata.insert("chunk_index".into(), chunk_index.into());
    metadata.insert("total_chunks".into(), total_chunks.into());
    metadata.insert("start_offset".into(), start_offset.into());
    metadata.insert("end_offset".into(), end_offset.into());
    metadata.insert(
        "indexed_at".into(),
        indexed_at.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
    );
    metadata
}

/// A chunk with its embedding, as submitted to the index.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl NewRecord {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self { chunk, vector }
    }
}

/// The stored unit. Immutable once inserted; updates are delete plus insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub sequence: u64,
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }

    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_chunk_id_sorts_positionally() {
        assert_eq!(chunk_id("doc", 7), "doc_chunk_000007");
        assert!(chunk_id("doc", 9) < chunk_id("doc", 10));
    }

    #[test]
    fn test_metadata_untagged_json() {
        let json = r#"{"flag": true, "year": 2024, "ratio": 0.5, "topic": "weather"}"#;
        let metadata: Metadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata["flag"], MetadataValue::Bool(true));
        assert_eq!(metadata["year"], MetadataValue::Integer(2024));
        assert_eq!(metadata["ratio"], MetadataValue::Float(0.5));
        assert_eq!(metadata["topic"], MetadataValue::String("weather".into()));

        let back = serde_json::to_string(&metadata).unwrap();
        let again: Metadata = serde_json::from_str(&back).unwrap();
        assert_eq!(metadata, again);
    }

    #[test]
    fn test_parse_loose() {
        assert_eq!(MetadataValue::parse_loose("42"), MetadataValue::Integer(42));
        assert_eq!(MetadataValue::parse_loose("4.5"), MetadataValue::Float(4.5));
        assert_eq!(MetadataValue::parse_loose("true"), MetadataValue::Bool(true));
        assert_eq!(
            MetadataValue::parse_loose("weather"),
            MetadataValue::String("weather".into())
        );
        assert_eq!(
            MetadataValue::parse_loose("NaN"),
            MetadataValue::String("NaN".into())
        );
    }

    #[test]
    fn test_inherited_metadata_overrides_parent() {
        let parent = Document::new("doc-1", "text")
            .with_metadata("topic", "weather")
            .with_metadata("chunk_index", "bogus")
            .metadata;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let metadata = inherited_metadata(&parent, "doc-1", 2, 3, 10, 20, at);

        assert_eq!(metadata["topic"].as_str(), Some("weather"));
        assert_eq!(metadata["chunk_index"], MetadataValue::Integer(2));
        assert_eq!(metadata["total_chunks"], MetadataValue::Integer(3));
        assert_eq!(metadata["indexed_at"].as_str(), Some("2024-05-01T12:00:00Z"));
    }
}
