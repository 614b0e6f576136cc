//! Embedding client with batching, bounded concurrency, deadlines and retries.
//!
//! [`EmbeddingClient`] is the only way the rest of the system talks to an
//! embedding model. It wraps any [`EmbeddingProvider`] and guarantees:
//!
//! - output order equals input order, even when a large request is split into
//!   several provider calls that run concurrently;
//! - no more than `max_concurrency` provider calls are in flight across all
//!   clones of the client;
//! - every provider call has a deadline, and transient failures are retried
//!   according to the injected [`RetryPolicy`];
//! - every returned vector has the configured dimension. A mismatch is a
//!   configuration problem and is reported immediately without retrying.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, provider_from_config};
use crate::retry::RetryPolicy;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Text embedded by [`EmbeddingClient::health_check`].
const HEALTH_PROBE: &str = "health check";

#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    model_id: String,
    dimension: usize,
    batch_size: usize,
    max_concurrency: usize,
    request_timeout: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("provider", &self.provider.provider_name())
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .field("batch_size", &self.batch_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl EmbeddingClient {
    /// Wrap an existing provider.
    ///
    /// The provider's advertised dimension must match `config.dimension`.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbedConfig) -> Result<Self> {
        config.validate()?;
        if provider.embedding_dimension() != config.dimension {
            return Err(EmbedError::invalid_config(format!(
                "provider {} produces {}-dimensional vectors but {} were configured",
                provider.provider_name(),
                provider.embedding_dimension(),
                config.dimension
            )));
        }

        Ok(Self {
            provider,
            model_id: config.model_id(),
            dimension: config.dimension,
            batch_size: config.batch_size,
            max_concurrency: config.max_concurrency,
            request_timeout: config.request_timeout(),
            retry: config.retry.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
        })
    }

    /// Build the configured provider and wrap it.
    pub fn from_config(config: &EmbedConfig) -> Result<Self> {
        let provider = provider_from_config(config)?;
        Self::new(provider, config)
    }

    /// Replace the retry policy (builder style)
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::malformed("No embedding generated for text"))
    }

    /// Embed many texts, returning one vector per input in input order.
    ///
    /// Inputs larger than `batch_size` are split into sub-batches that run
    /// concurrently. The first failing sub-batch fails the whole call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        tracing::debug!(
            "Embedding {} texts in {} batch(es) with {}",
            texts.len(),
            batches.len(),
            self.model_id
        );

        let per_batch: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| self.embed_one_batch(batch))
            .buffered(self.max_concurrency)
            .try_collect()
            .await?;

        Ok(per_batch.into_iter().flatten().collect())
    }

    /// Embed a probe text and check the result has the configured dimension.
    pub async fn health_check(&self) -> Result<()> {
        let vector = self.embed(HEALTH_PROBE).await?;
        tracing::debug!(
            "Embedding health check succeeded ({} dimensions)",
            vector.len()
        );
        Ok(())
    }

    async fn embed_one_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        self.retry
            .run("embedding batch", |_attempt| async move {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(EmbedError::embedding_gen)?;

                let result = tokio::time::timeout(
                    self.request_timeout,
                    self.provider.embed_texts(batch),
                )
                .await
                .map_err(|_| EmbedError::Timeout {
                    after: self.request_timeout,
                })??;

                self.check_result(batch.len(), result)
            })
            .await
    }

    fn check_result(&self, expected: usize, result: EmbeddingResult) -> Result<Vec<Vec<f32>>> {
        if result.len() != expected {
            return Err(EmbedError::malformed(format!(
                "expected {} embeddings, got {}",
                expected,
                result.len()
            )));
        }
        if let Some(bad) = result
            .embeddings
            .iter()
            .find(|v| v.len() != self.dimension)
        {
            tracing::error!(
                "Model {} returned a {}-dimensional vector, expected {}",
                self.model_id,
                bad.len(),
                self.dimension
            );
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }
        Ok(result.embeddings)
    }
}
