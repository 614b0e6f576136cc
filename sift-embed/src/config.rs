//! Configuration for embedding providers and the embedding client

use crate::error::{EmbedError, Result};
use crate::retry::RetryPolicy;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which provider backs an [`crate::EmbeddingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic local feature hashing, no network access
    #[default]
    Hashing,
    /// OpenAI-compatible `/embeddings` HTTP endpoint
    Http,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hashing => write!(f, "hashing"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Configuration for embedding generation
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[serde(default)]
pub struct EmbedConfig {
    /// Provider implementation to use
    #[builder(default)]
    pub provider: ProviderKind,
    /// Name of the embedding model, sent to HTTP endpoints and stored with the index
    #[builder(default = r#""hashing-v1".to_string()"#)]
    pub model_name: String,
    /// Base URL of the HTTP endpoint (e.g., "http://localhost:8080/v1")
    #[builder(default)]
    pub base_url: Option<String>,
    /// Bearer token for the HTTP endpoint
    #[builder(default)]
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the bearer token, used when `api_key` is unset
    #[builder(default)]
    pub api_key_env: Option<String>,
    /// Dimensionality every returned vector must have
    #[builder(default = "384")]
    pub dimension: usize,
    /// Maximum number of texts per provider call
    #[builder(default = "32")]
    pub batch_size: usize,
    /// Maximum number of provider calls in flight at once
    #[builder(default = "4")]
    pub max_concurrency: usize,
    /// Deadline for a single provider call in milliseconds
    #[builder(default = "30_000")]
    pub request_timeout_ms: u64,
    /// Whether to L2-normalize vectors returned by the provider
    #[builder(default = "true")]
    pub normalize: bool,
    /// Backoff policy for transient failures
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl EmbedConfig {
    /// Create a new embedding configuration using the builder
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Configuration for the offline hashing provider
    pub fn hashing(dimension: usize) -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model_name: "hashing-v1".to_string(),
            dimension,
            ..Self::default()
        }
    }

    /// Configuration for an OpenAI-compatible HTTP endpoint
    pub fn http(base_url: impl Into<String>, model_name: impl Into<String>, dimension: usize) -> Self {
        Self {
            provider: ProviderKind::Http,
            model_name: model_name.into(),
            base_url: Some(base_url.into()),
            dimension,
            ..Self::default()
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the number of concurrent provider calls (builder style)
    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..self
        }
    }

    /// Set the per-call deadline (builder style)
    pub fn with_request_timeout(self, timeout: Duration) -> Self {
        Self {
            request_timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    /// Set the retry policy (builder style)
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Set the bearer token (builder style)
    pub fn with_api_key<S: Into<String>>(self, api_key: S) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..self
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The bearer token, taken from `api_key` or else from `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|key| !key.is_empty())
        })
    }

    /// Identifier of the model that produced a set of vectors.
    ///
    /// Two configurations with the same id produce comparable vectors.
    pub fn model_id(&self) -> String {
        format!("{}:{}:{}", self.provider, self.model_name, self.dimension)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be greater than zero"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be greater than zero"));
        }
        if self.max_concurrency == 0 {
            return Err(EmbedError::invalid_config(
                "max_concurrency must be greater than zero",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(EmbedError::invalid_config(
                "request_timeout_ms must be greater than zero",
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.provider == ProviderKind::Http
            && self.base_url.as_deref().is_none_or(|url| url.trim().is_empty())
        {
            tracing::error!("HTTP embedding provider configured without base_url");
            return Err(EmbedError::invalid_config(
                "base_url is required for the http provider",
            ));
        }
        self.retry.validate()?;

        tracing::debug!("Embedding configuration valid for: {}", self.model_id());
        Ok(())
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model_name: "hashing-v1".to_string(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            dimension: 384,
            batch_size: 32,
            max_concurrency: 4,
            request_timeout_ms: 30_000,
            normalize: true,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EmbedConfig::default();

        assert_eq!(config.provider, ProviderKind::Hashing);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.normalize);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_methods() {
        let config = EmbedConfig::hashing(64)
            .with_batch_size(8)
            .with_normalize(false)
            .with_max_concurrency(2);

        assert_eq!(config.dimension, 64);
        assert_eq!(config.batch_size, 8);
        assert!(!config.normalize);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.model_id(), "hashing:hashing-v1:64");
    }

    #[test]
    fn test_derive_builder_pattern() {
        let config = EmbedConfig::builder()
            .provider(ProviderKind::Http)
            .model_name("nv-embedqa-e5-v5")
            .base_url(Some("http://localhost:8000/v1".to_string()))
            .dimension(1024usize)
            .batch_size(16usize)
            .build()
            .unwrap();

        assert_eq!(config.provider, ProviderKind::Http);
        assert_eq!(config.dimension, 1024);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_requires_base_url() {
        let config = EmbedConfig {
            provider: ProviderKind::Http,
            ..EmbedConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EmbedError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(EmbedConfig::hashing(0).validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(0).validate().is_err());
        assert!(
            EmbedConfig::default()
                .with_max_concurrency(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_deserialize_partial_toml_style_json() {
        let config: EmbedConfig = serde_json::from_str(
            r#"{"provider": "http", "base_url": "http://embed:8080", "dimension": 768,
                "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.provider, ProviderKind::Http);
        assert_eq!(config.dimension, 768);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 200);
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let config = EmbedConfig::default().with_api_key("secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
        assert_eq!(config.resolve_api_key().as_deref(), Some("secret"));
    }
}
