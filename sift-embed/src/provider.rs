//! Embedding provider implementations

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fnv::FnvHasher;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use std::sync::Arc;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result.
    ///
    /// The dimension is inferred from the first embedding vector and defaults to 0
    /// when there are no embeddings.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for multiple texts, in input order
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate an embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::malformed("No embedding generated for text"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Get the model this provider embeds with
    fn model_name(&self) -> &str;
}

/// Build the provider described by `config`.
pub fn provider_from_config(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    let provider: Arc<dyn EmbeddingProvider> = match config.provider {
        ProviderKind::Hashing => Arc::new(HashingEmbeddingProvider::new(config.dimension)?),
        ProviderKind::Http => Arc::new(HttpEmbeddingProvider::new(config)?),
    };
    tracing::info!(
        "Using {} embedding provider with model {} ({} dimensions)",
        provider.provider_name(),
        provider.model_name(),
        provider.embedding_dimension()
    );
    Ok(provider)
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
///
/// Works with hosted APIs and with self-hosted inference servers that expose the
/// same request shape. Deadlines and retries are applied by
/// [`crate::EmbeddingClient`], not here.
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model_name: String,
    api_key: Option<String>,
    dimension: usize,
    normalize: bool,
}

impl std::fmt::Debug for HttpEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingProvider")
            .field("endpoint", &self.endpoint)
            .field("model_name", &self.model_name)
            .field("api_key", &self.api_key.is_some())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbedConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| EmbedError::invalid_config("base_url is required for the http provider"))?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model_name: config.model_name.clone(),
            api_key: config.resolve_api_key(),
            dimension: config.dimension,
            normalize: config.normalize,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!(
            "Requesting {} embeddings from {}",
            texts.len(),
            self.endpoint
        );

        let body = serde_json::to_vec(&EmbeddingsRequest {
            model: &self.model_name,
            input: texts,
            encoding_format: "float",
        })
        .map_err(EmbedError::embedding_gen)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let mut parsed: EmbeddingsResponse = serde_json::from_slice(&bytes)
            .map_err(|e| EmbedError::malformed(format!("invalid JSON body: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbedError::malformed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        // Servers may answer out of order; `index` refers to the input position.
        parsed.data.sort_by_key(|d| d.index);
        if parsed.data.iter().enumerate().any(|(i, d)| d.index != i) {
            return Err(EmbedError::malformed(
                "embedding indices do not cover the request",
            ));
        }

        let embeddings = parsed
            .data
            .into_iter()
            .map(|d| {
                let mut embedding = d.embedding;
                if self.normalize {
                    l2_normalize(&mut embedding);
                }
                embedding
            })
            .collect();

        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "http"
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Deterministic lexical embedder based on feature hashing.
///
/// Each lowercase alphanumeric token is hashed with FNV into one of `dimension`
/// buckets with a hash-derived sign, and the result is L2-normalized. Texts that
/// share vocabulary get a positive cosine similarity. Useful for offline operation
/// and for tests that need stable vectors.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dimension: usize,
    token_pattern: Regex,
}

impl HashingEmbeddingProvider {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(EmbedError::invalid_config(
                "hashing provider dimension must be greater than zero",
            ));
        }
        let token_pattern = Regex::new(r"[\p{L}\p{N}]+").map_err(EmbedError::embedding_gen)?;
        Ok(Self {
            dimension,
            token_pattern,
        })
    }

    /// Embed a single text synchronously.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        for token in self.token_pattern.find_iter(&lowered) {
            let mut hasher = FnvHasher::default();
            hasher.write(token.as_str().as_bytes());
            let hash = hasher.finish();

            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts.iter().map(|t| self.embed_sync(t)).collect();
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn model_name(&self) -> &str {
        "hashing-v1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::new(vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
        assert!(EmbeddingResult::new(vec![]).is_empty());
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_hashing_provider_is_deterministic() {
        let provider = HashingEmbeddingProvider::new(64).unwrap();
        let texts = vec!["Rust is fast".to_string(), "rust IS fast!".to_string()];
        let result = provider.embed_texts(&texts).await.unwrap();

        assert_eq!(result.dimension, 64);
        // Case and punctuation do not change the token set
        assert_eq!(result.embeddings[0], result.embeddings[1]);
        let norm: f32 = result.embeddings[0].iter().map(|x| x * x).sum::<f32>();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hashing_provider_similarity() {
        let provider = HashingEmbeddingProvider::new(256).unwrap();
        let weather = provider.embed_text("weather in singapore").await.unwrap();
        let related = provider
            .embed_text("singapore weather is humid")
            .await
            .unwrap();
        let unrelated = provider.embed_text("stock market prices").await.unwrap();

        assert!(cosine(&weather, &related) > cosine(&weather, &unrelated));
    }

    #[tokio::test]
    async fn test_hashing_provider_empty_text() {
        let provider = HashingEmbeddingProvider::new(16).unwrap();
        let v = provider.embed_text("").await.unwrap();
        assert_eq!(v, vec![0.0; 16]);
    }

    #[test]
    fn test_provider_from_config() {
        let provider = provider_from_config(&EmbedConfig::hashing(32)).unwrap();
        assert_eq!(provider.provider_name(), "hashing");
        assert_eq!(provider.embedding_dimension(), 32);

        let http = provider_from_config(&EmbedConfig::http("http://localhost:9/v1/", "m", 8)).unwrap();
        assert_eq!(http.provider_name(), "http");
        assert_eq!(http.model_name(), "m");
    }

    #[test]
    fn test_http_endpoint_url() {
        let provider =
            HttpEmbeddingProvider::new(&EmbedConfig::http("http://localhost:9/v1/", "m", 8))
                .unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:9/v1/embeddings");
    }
}
