use crate::error::Result;
use crate::model::{Chunk, Document, chunk_id, inherited_metadata};
use chrono::{DateTime, Utc};
use sift_context::{Chunker, ChunkerConfig};
use std::path::Path;

/// Turns documents into index-ready chunks with inherited metadata.
#[derive(Debug, Clone)]
pub struct ChunkingStrategy {
    chunker: Chunker,
}

impl ChunkingStrategy {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        Ok(Self {
            chunker: Chunker::new(config)?,
        })
    }

    pub fn config(&self) -> &ChunkerConfig {
        self.chunker.config()
    }

    /// Split a document into chunks.
    ///
    /// Chunk ids and offsets depend only on the text and the chunker
    /// configuration, so re-ingesting identical text yields identical ids.
    pub fn chunk_document(&self, document: &Document, indexed_at: DateTime<Utc>) -> Vec<Chunk> {
        let pieces = self.chunker.split(&document.text);
        let total = pieces.len();
        pieces
            .into_iter()
            .map(|piece| {
                let metadata = inherited_metadata(
                    &document.metadata,
                    &document.document_id,
                    piece.sequence,
                    total,
                    piece.start_offset,
                    piece.end_offset,
                    indexed_at,
                );
                Chunk {
                    chunk_id: chunk_id(&document.document_id, piece.sequence),
                    document_id: document.document_id.clone(),
                    chunk_index: piece.sequence,
                    start_offset: piece.start_offset,
                    end_offset: piece.end_offset,
                    text: piece.text,
                    metadata,
                }
            })
            .collect()
    }

    /// Decide whether a file found while walking a directory is worth reading.
    pub fn should_index_file(&self, file_path: &Path) -> bool {
        // Skip hidden files and common binary file extensions
        if let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) {
            if filename.starts_with('.') {
                return false;
            }
        }

        match file_path.extension().and_then(|ext| ext.to_str()) {
            Some("md") | Some("markdown") | Some("txt") | Some("rst") | Some("adoc")
            | Some("html") | Some("htm") | Some("csv") | Some("json") | Some("yaml")
            | Some("yml") | Some("toml") => true,

            Some("exe") | Some("dll") | Some("so") | Some("dylib") | Some("bin") | Some("png")
            | Some("jpg") | Some("jpeg") | Some("gif") | Some("ico") | Some("wasm") | Some("pdf")
            | Some("zip") | Some("gz") | Some("db") | Some("lock") => false,

            None => {
                if let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) {
                    matches!(filename, "README" | "CHANGELOG" | "LICENSE" | "NOTICE")
                } else {
                    false
                }
            }

            // Unknown extensions - default to indexing, non-UTF-8 content is reported later
            Some(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetadataValue;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn strategy(size: usize, overlap: usize) -> ChunkingStrategy {
        ChunkingStrategy::new(ChunkerConfig::new(size, overlap)).unwrap()
    }

    #[test]
    fn test_chunk_document_ids_and_metadata() {
        let text = "x".repeat(1000);
        let document = Document::new("report", text).with_metadata("topic", "weather");
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        let chunks = strategy(300, 50).chunk_document(&document, at);
        assert_eq!(chunks.len(), 4);

        let spans: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start_offset, c.end_offset)).collect();
        assert_eq!(spans, vec![(0, 300), (250, 550), (500, 800), (750, 1000)]);

        let last = &chunks[3];
        assert_eq!(last.chunk_id, "report_chunk_000003");
        assert_eq!(last.metadata["topic"].as_str(), Some("weather"));
        assert_eq!(last.metadata["total_chunks"], MetadataValue::Integer(4));
        assert_eq!(last.metadata["start_offset"], MetadataValue::Integer(750));
        assert_eq!(last.metadata["indexed_at"].as_str(), Some("2024-01-02T03:04:05Z"));
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let document = Document::new("d", "The quick brown fox jumps over the lazy dog. ".repeat(40));
        let at = Utc::now();
        let s = strategy(120, 20);
        let a = s.chunk_document(&document, at);
        let b = s.chunk_document(&document, at);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        let document = Document::new("d", "");
        assert!(strategy(100, 10).chunk_document(&document, Utc::now()).is_empty());
    }

    #[test]
    fn test_invalid_config_is_configuration_error() {
        let err = ChunkingStrategy::new(ChunkerConfig::new(100, 100)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_should_index_file() {
        let s = strategy(100, 10);
        assert!(s.should_index_file(&PathBuf::from("notes/weather.md")));
        assert!(s.should_index_file(&PathBuf::from("README")));
        assert!(!s.should_index_file(&PathBuf::from(".hidden.txt")));
        assert!(!s.should_index_file(&PathBuf::from("photo.png")));
        assert!(!s.should_index_file(&PathBuf::from("Makefile")));
    }
}
