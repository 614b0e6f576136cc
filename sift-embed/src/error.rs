//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Errors fall into two groups. Transient failures (timeouts, transport errors,
/// throttling and server-side HTTP errors) are retried by
/// [`crate::EmbeddingClient`] according to its [`crate::RetryPolicy`]; once the
/// policy gives up they are wrapped in [`EmbedError::Unavailable`]. Everything
/// else is permanent and surfaces immediately.
///
/// # Error Categories
///
/// - **Configuration Errors**: Invalid settings, or a model whose output
///   dimension differs from the configured one
/// - **Transient Errors**: Timeouts, transport failures, 429 and 5xx responses
/// - **Response Errors**: Replies that cannot be decoded or have the wrong shape
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when the embedding configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// The model returned a vector of the wrong length. Never retried.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding endpoint answered with a non-success status
    #[error("Embedding endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never produced a response
    #[error("Embedding request failed: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    /// A single embedding call exceeded its deadline
    #[error("Embedding request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The endpoint answered, but not with what was asked for
    #[error("Malformed embedding response: {message}")]
    MalformedResponse { message: String },

    /// Retries were exhausted on a transient failure
    #[error("Embedding service unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable {
        attempts: u32,
        #[source]
        last_error: Box<EmbedError>,
    },

    /// Error during embedding generation
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EmbedError {
    /// Create an embedding generation error from any error type.
    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::EmbeddingGeneration {
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a malformed response error with a custom message.
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Throttling (429), server errors (5xx), timeouts and transport failures are
    /// transient. Client errors, malformed replies and dimension mismatches are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Transport { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether this error means the embedding service could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
