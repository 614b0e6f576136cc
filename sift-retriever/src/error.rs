//! Error taxonomy for indexing and retrieval.
//!
//! Every variant carries the identifier needed to diagnose it without reading
//! the code: a document or chunk id, a query field, or a file path.
//!
//! - [`RetrievalError::Configuration`] and [`RetrievalError::IndexCorruption`]
//!   are fatal. They halt startup or the offending ingestion batch.
//! - [`RetrievalError::EmbeddingUnavailable`] is raised after the embedding
//!   client's retries are exhausted. Ingestion reports it per chunk.
//! - [`RetrievalError::InvalidQuery`] and [`RetrievalError::Filter`] are caused
//!   by the caller and are raised before the index is touched.

use sift_embed::EmbedError;

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Misconfiguration: dimension or model mismatch, invalid chunking parameters
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// The embedding service could not produce a vector
    #[error("Embedding unavailable for {context}: {source}")]
    EmbeddingUnavailable {
        context: String,
        #[source]
        source: EmbedError,
    },

    /// The query itself is malformed
    #[error("Invalid query field '{field}': {reason}")]
    InvalidQuery { field: String, reason: String },

    /// A metadata filter is malformed or does not fit the schema
    #[error("Invalid filter on '{field}': {reason}")]
    Filter { field: String, reason: String },

    /// Persisted index state cannot be trusted
    #[error("Index corruption in {path}: {reason}")]
    IndexCorruption { path: String, reason: String },

    /// The re-ranking stage failed
    #[error("Re-ranking failed: {reason}")]
    Rerank { reason: String },

    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: sqlx::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl RetrievalError {
    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn invalid_query<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InvalidQuery {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn filter<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Filter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn corruption<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::IndexCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn rerank<S: Into<String>>(reason: S) -> Self {
        Self::Rerank {
            reason: reason.into(),
        }
    }

    /// Classify an embedding failure.
    ///
    /// Dimension mismatches and invalid embedding settings are configuration
    /// problems; everything else means the service did not deliver a vector.
    pub fn from_embed<C: Into<String>>(context: C, source: EmbedError) -> Self {
        match source {
            EmbedError::DimensionMismatch { expected, actual } => Self::Configuration {
                reason: format!(
                    "embedding model returned {actual}-dimensional vectors for {}, index expects {expected}",
                    context.into()
                ),
            },
            EmbedError::InvalidConfig { message } => Self::Configuration { reason: message },
            source => Self::EmbeddingUnavailable {
                context: context.into(),
                source,
            },
        }
    }

    /// Fatal errors need operator attention and must not be retried blindly.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::IndexCorruption { .. }
        )
    }
}

impl From<sift_context::ChunkConfigError> for RetrievalError {
    fn from(e: sift_context::ChunkConfigError) -> Self {
        Self::configuration(format!("invalid chunking parameters: {e}"))
    }
}
