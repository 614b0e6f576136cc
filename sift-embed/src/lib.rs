//! # sift-embed
//!
//! Text embedding for the sift retrieval engine. Providers turn text into
//! vectors; [`EmbeddingClient`] wraps a provider with the operational guarantees
//! the indexer and query path rely on.
//!
//! ## Features
//!
//! - **HTTP Provider**: Any OpenAI-compatible `/embeddings` endpoint
//! - **Hashing Provider**: Deterministic offline embeddings for development and tests
//! - **Ordered Batching**: Large inputs are split and reassembled in input order
//! - **Bounded Concurrency**: A shared semaphore caps in-flight provider calls
//! - **Deadlines and Retries**: Per-call timeouts with capped exponential backoff
//! - **Dimension Checks**: Wrong-sized vectors are rejected, never stored
//!
//! ## Quick Start
//!
//! ```no_run
//! use sift_embed::{EmbedConfig, EmbeddingClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EmbedConfig::http("http://localhost:8080/v1", "nv-embedqa-e5-v5", 1024)
//!     .with_batch_size(16);
//! let client = EmbeddingClient::from_config(&config)?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let vectors = client.embed_batch(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}", vectors.len(), client.dimension());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: Provider selection, batching, concurrency and timeout settings
//! - [`provider`]: The [`EmbeddingProvider`] trait and its implementations
//! - [`client`]: [`EmbeddingClient`], the retrying, concurrency-bounded front end
//! - [`retry`]: [`RetryPolicy`] and its backoff schedule
//! - [`error`]: Error types and result handling
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! [`EmbedError::is_retryable`] separates transient failures from permanent ones.

pub mod client;
pub mod config;
pub mod error;
pub mod provider;
pub mod retry;

// Re-export main types for easy access
pub use client::EmbeddingClient;
pub use config::{EmbedConfig, EmbedConfigBuilder, ProviderKind};
pub use error::{EmbedError, Result};
pub use provider::{
    EmbeddingProvider, EmbeddingResult, HashingEmbeddingProvider, HttpEmbeddingProvider,
    l2_normalize, provider_from_config,
};
pub use retry::RetryPolicy;
