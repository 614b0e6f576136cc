pub mod text;

// Re-export the chunker for external use
pub use text::{
    ChunkConfigError, Chunker, ChunkerConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, TextChunk,
    reconstruct,
};
