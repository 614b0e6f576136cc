//! This module splits document text into overlapping, fixed-size windows that
//! can be embedded independently and stored in a vector index.
//!
//! The module defines three main items:
//! - [`ChunkerConfig`]: Window size, overlap and the boundary-snapping knobs.
//! - [`Chunker`]: A validated chunker that turns text into [`TextChunk`]s.
//! - [`TextChunk`]: A single window with its position in the source text.
//!
//! # Key Features
//!
//! *   **Character Offsets**: All sizes and offsets count Unicode scalar values,
//!     never bytes, so multi-byte text is never cut inside a character.
//! *   **Exact Overlap**: Consecutive chunks share exactly `overlap` characters.
//!     Dropping the first `overlap` characters of every chunk after the first and
//!     concatenating the rest reproduces the input (see [`reconstruct`]).
//! *   **Whitespace Snapping**: When a window would end in the middle of a word,
//!     the end is pulled back to the nearest whitespace within a small lookback
//!     window, as long as the chunk stays at least `min_chunk_size` long.
//! *   **Determinism**: The same text and configuration always produce the same
//!     boundaries.
//!
//! # Usage
//!
//! ```
//! use sift_context::text::{Chunker, ChunkerConfig, reconstruct};
//!
//! let chunker = Chunker::new(ChunkerConfig::new(300, 50)).unwrap();
//! let text = "x".repeat(1000);
//! let chunks = chunker.split(&text);
//!
//! let bounds: Vec<(usize, usize)> = chunks
//!     .iter()
//!     .map(|c| (c.start_offset, c.end_offset))
//!     .collect();
//! assert_eq!(bounds, vec![(0, 300), (250, 550), (500, 800), (750, 1000)]);
//! assert_eq!(reconstruct(&chunks, 50), text);
//! ```
use serde::{Deserialize, Serialize};

/// Default window size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default overlap between consecutive windows in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Errors raised when a chunker configuration cannot produce valid chunks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkConfigError {
    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,

    #[error("overlap ({overlap}) must be smaller than chunk_size ({chunk_size})")]
    OverlapTooLarge { chunk_size: usize, overlap: usize },

    #[error("min_chunk_size ({min_chunk_size}) must not exceed chunk_size ({chunk_size})")]
    MinChunkTooLarge {
        chunk_size: usize,
        min_chunk_size: usize,
    },

    #[error("min_chunk_size ({min_chunk_size}) must be greater than overlap ({overlap})")]
    MinChunkNotAboveOverlap {
        min_chunk_size: usize,
        overlap: usize,
    },
}

/// Configuration for [`Chunker`].
///
/// All values are measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Maximum number of characters in one chunk.
    pub chunk_size: usize,
    /// Number of characters shared by two consecutive chunks.
    pub overlap: usize,
    /// A chunk is never shortened below this length when snapping to whitespace.
    pub min_chunk_size: usize,
    /// How far back from the hard window end to look for whitespace.
    pub lookback: usize,
}

impl ChunkerConfig {
    /// Create a configuration with derived snapping defaults.
    ///
    /// `min_chunk_size` becomes half the window (but always above the overlap) and
    /// `lookback` becomes a tenth of the window.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size,
            overlap,
            min_chunk_size: (chunk_size / 2).max(overlap + 1).min(chunk_size),
            lookback: (chunk_size / 10).max(1),
        }
    }

    pub fn with_min_chunk_size(self, min_chunk_size: usize) -> Self {
        Self {
            min_chunk_size,
            ..self
        }
    }

    pub fn with_lookback(self, lookback: usize) -> Self {
        Self { lookback, ..self }
    }

    /// Check that the configuration guarantees forward progress.
    pub fn validate(&self) -> Result<(), ChunkConfigError> {
        if self.chunk_size == 0 {
            return Err(ChunkConfigError::ZeroChunkSize);
        }
        if self.overlap >= self.chunk_size {
            return Err(ChunkConfigError::OverlapTooLarge {
                chunk_size: self.chunk_size,
                overlap: self.overlap,
            });
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(ChunkConfigError::MinChunkTooLarge {
                chunk_size: self.chunk_size,
                min_chunk_size: self.min_chunk_size,
            });
        }
        if self.min_chunk_size <= self.overlap {
            return Err(ChunkConfigError::MinChunkNotAboveOverlap {
                min_chunk_size: self.min_chunk_size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

/// A single window of a source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Position of this chunk within the document (0-indexed).
    pub sequence: usize,
    /// Character offset of the first character (inclusive).
    pub start_offset: usize,
    /// Character offset one past the last character (exclusive).
    pub end_offset: usize,
    /// The chunk text.
    pub text: String,
}

impl TextChunk {
    /// Number of characters in the chunk.
    pub fn char_len(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// Splits text into overlapping windows according to a validated [`ChunkerConfig`].
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Creates a new chunker, rejecting configurations that could stall or
    /// produce empty chunks.
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Splits `text` into chunks.
    ///
    /// Empty input yields no chunks. Every chunk is non-empty, chunks cover the
    /// whole text in order, and consecutive chunks overlap by exactly
    /// `config.overlap` characters.
    ///
    /// # Examples
    ///
    /// ```
    /// use sift_context::text::{Chunker, ChunkerConfig};
    ///
    /// let config = ChunkerConfig::new(12, 2).with_lookback(4);
    /// let chunker = Chunker::new(config).unwrap();
    /// let chunks = chunker.split("the quick brown fox jumps");
    ///
    /// assert_eq!(chunks[0].text, "the quick ");
    /// assert_eq!(chunks.last().unwrap().end_offset, 25);
    /// ```
    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        // Byte position of every character boundary, plus the end of the text.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();

        let mut chunks = Vec::new();
        if len == 0 {
            return chunks;
        }

        let ChunkerConfig {
            chunk_size,
            overlap,
            min_chunk_size,
            lookback,
        } = self.config;

        let mut start = 0;
        loop {
            let mut end = (start + chunk_size).min(len);
            if end < len {
                end = self.snap_to_whitespace(&chars, start, end, min_chunk_size, lookback);
            }

            chunks.push(TextChunk {
                sequence: chunks.len(),
                start_offset: start,
                end_offset: end,
                text: text[boundaries[start]..boundaries[end]].to_string(),
            });

            if end == len {
                break;
            }
            // end - start >= min_chunk_size > overlap, so this always advances
            start = end - overlap;
        }

        chunks
    }

    fn snap_to_whitespace(
        &self,
        chars: &[char],
        start: usize,
        end: usize,
        min_chunk_size: usize,
        lookback: usize,
    ) -> usize {
        let floor = (start + min_chunk_size).max(end.saturating_sub(lookback));
        if floor > end {
            return end;
        }
        (floor..=end)
            .rev()
            .find(|&pos| is_word_boundary(chars, pos))
            .unwrap_or(end)
    }
}

/// A position is a word boundary if either neighbouring character is whitespace.
fn is_word_boundary(chars: &[char], pos: usize) -> bool {
    let before = pos.checked_sub(1).and_then(|i| chars.get(i));
    let after = chars.get(pos);
    before.is_some_and(|c| c.is_whitespace()) || after.is_some_and(|c| c.is_whitespace())
}

/// Rebuilds the source text from chunks produced with the given overlap.
pub fn reconstruct(chunks: &[TextChunk], overlap: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(&chunk.text);
        } else {
            out.extend(chunk.text.chars().skip(overlap));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(chunks: &[TextChunk]) -> Vec<(usize, usize)> {
        chunks
            .iter()
            .map(|c| (c.start_offset, c.end_offset))
            .collect()
    }

    #[test]
    fn test_fixed_windows_without_whitespace() {
        let chunker = Chunker::new(ChunkerConfig::new(300, 50)).unwrap();
        let text = "a".repeat(1000);
        let chunks = chunker.split(&text);

        assert_eq!(
            bounds(&chunks),
            vec![(0, 300), (250, 550), (500, 800), (750, 1000)]
        );
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
        assert_eq!(
            chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        assert!(chunker.split("").is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = Chunker::new(ChunkerConfig::new(100, 10)).unwrap();
        let chunks = chunker.split("hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello world");
        assert_eq!(bounds(&chunks), vec![(0, 11)]);
    }

    #[test]
    fn test_snaps_to_whitespace_in_lookback() {
        // chunk_size 12, lookback 1 by default; widen the lookback to reach the space
        let config = ChunkerConfig::new(12, 2).with_lookback(4);
        let chunker = Chunker::new(config).unwrap();
        let chunks = chunker.split("the quick brown fox jumps");

        assert_eq!(chunks[0].text, "the quick ");
        assert_eq!(chunks[0].end_offset, 10);
        assert_eq!(chunks[1].start_offset, 8);
        assert_eq!(reconstruct(&chunks, 2), "the quick brown fox jumps");
    }

    #[test]
    fn test_min_chunk_size_limits_snapping() {
        // The only whitespace is too early to snap to without going under the minimum.
        let config = ChunkerConfig::new(10, 2)
            .with_min_chunk_size(8)
            .with_lookback(10);
        let chunker = Chunker::new(config).unwrap();
        let chunks = chunker.split("ab cdefghijklmnop");

        assert_eq!(chunks[0].end_offset, 10);
    }

    #[test]
    fn test_deterministic() {
        let chunker = Chunker::new(ChunkerConfig::new(40, 8)).unwrap();
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(20);
        assert_eq!(chunker.split(&text), chunker.split(&text));
    }

    #[test]
    fn test_reconstruction_with_overlap() {
        let text = "Singapore is hot and humid all year round.\n\nParis has four distinct seasons, \
                    with mild springs and cold winters. "
            .repeat(15);
        for (size, overlap) in [(30, 5), (64, 16), (100, 0), (257, 50)] {
            let chunker = Chunker::new(ChunkerConfig::new(size, overlap)).unwrap();
            let chunks = chunker.split(&text);
            assert_eq!(reconstruct(&chunks, overlap), text, "size={size}");

            for pair in chunks.windows(2) {
                assert_eq!(pair[0].end_offset - pair[1].start_offset, overlap);
                assert!(pair[0].char_len() <= size);
            }
        }
    }

    #[test]
    fn test_multibyte_offsets_are_characters() {
        let chunker = Chunker::new(ChunkerConfig::new(5, 1)).unwrap();
        let text = "日本語のテキストです";
        let chunks = chunker.split(text);

        assert_eq!(chunks[0].text, "日本語のテ");
        assert_eq!(bounds(&chunks)[0], (0, 5));
        assert_eq!(chunks.last().unwrap().end_offset, text.chars().count());
        assert_eq!(reconstruct(&chunks, 1), text);
    }

    #[test]
    fn test_invalid_configurations() {
        assert_eq!(
            Chunker::new(ChunkerConfig::new(0, 0)).unwrap_err(),
            ChunkConfigError::ZeroChunkSize
        );
        assert_eq!(
            Chunker::new(ChunkerConfig::new(50, 50)).unwrap_err(),
            ChunkConfigError::OverlapTooLarge {
                chunk_size: 50,
                overlap: 50
            }
        );
        assert!(matches!(
            Chunker::new(ChunkerConfig::new(50, 10).with_min_chunk_size(60)),
            Err(ChunkConfigError::MinChunkTooLarge { .. })
        ));
        assert!(matches!(
            Chunker::new(ChunkerConfig::new(50, 10).with_min_chunk_size(10)),
            Err(ChunkConfigError::MinChunkNotAboveOverlap { .. })
        ));
    }

    #[test]
    fn test_default_config() {
        let config = ChunkerConfig::default();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.overlap, 50);
        assert_eq!(config.min_chunk_size, 512);
        assert_eq!(config.lookback, 102);
        assert!(config.validate().is_ok());
    }
}
