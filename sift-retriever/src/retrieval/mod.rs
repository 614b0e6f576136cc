//! Ingestion and query paths built on top of the index.
//!
//! - **Ingestion**: [`IngestionEngine`] chunks documents with a
//!   [`ChunkingStrategy`], embeds the chunks and replaces each document in the
//!   index atomically.
//! - **Query**: [`QueryBuilder`] validates and embeds a query into a
//!   [`QueryPlan`], and [`RetrievalService`] runs it against one snapshot,
//!   optionally through a [`RerankStage`].

pub mod chunking_strategy;
pub mod ingestion;
pub mod query;
pub mod rerank;
pub mod service;
pub mod templates;

pub use chunking_strategy::ChunkingStrategy;
pub use ingestion::{ChunkFailure, IngestionConfig, IngestionEngine, IngestionReport, ProcessingStats};
pub use query::{FieldType, MetadataSchema, QueryBuilder, QueryContext, QueryLimits, QueryPlan};
pub use rerank::{
    CrossEncoderReranker, HttpCrossEncoder, LexicalOverlapScorer, RelevanceScorer, RerankStage,
    RerankedHit,
};
pub use service::{HealthReport, RankedPassage, RerankTrace, RetrievalResult, RetrievalService, TraceEntry};
pub use templates::{QueryTemplate, QueryTemplates};

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use sift_embed::{
        EmbedConfig, EmbedError, EmbeddingClient, EmbeddingProvider, EmbeddingResult,
        HashingEmbeddingProvider, RetryPolicy,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hashing embeddings that count provider calls and fail on a marker word.
    pub(crate) struct CountingProvider {
        inner: HashingEmbeddingProvider,
        calls: Arc<AtomicUsize>,
        fail_marker: Option<String>,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed_texts(&self, texts: &[String]) -> sift_embed::Result<EmbeddingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(marker) = &self.fail_marker {
                if texts.iter().any(|t| t.contains(marker.as_str())) {
                    return Err(EmbedError::Http {
                        status: 503,
                        body: "unavailable".into(),
                    });
                }
            }
            self.inner.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            self.inner.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            self.inner.provider_name()
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
    }

    fn client(dimension: usize, fail_marker: Option<&str>) -> (EmbeddingClient, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            inner: HashingEmbeddingProvider::new(dimension).unwrap(),
            calls: Arc::clone(&calls),
            fail_marker: fail_marker.map(String::from),
        };
        let config = EmbedConfig::hashing(dimension).with_retry(RetryPolicy::no_retry());
        (EmbeddingClient::new(Arc::new(provider), &config).unwrap(), calls)
    }

    pub(crate) fn counting_client(dimension: usize) -> (EmbeddingClient, Arc<AtomicUsize>) {
        client(dimension, None)
    }

    pub(crate) fn flaky_client(dimension: usize, fail_marker: &str) -> EmbeddingClient {
        client(dimension, Some(fail_marker)).0
    }

    /// Returns vectors of the right size whose first component is NaN.
    pub(crate) struct NanProvider {
        pub(crate) dimension: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for NanProvider {
        async fn embed_texts(&self, texts: &[String]) -> sift_embed::Result<EmbeddingResult> {
            let mut vector = vec![0.5; self.dimension];
            vector[0] = f32::NAN;
            Ok(EmbeddingResult::new(vec![vector; texts.len()]))
        }

        fn embedding_dimension(&self) -> usize {
            self.dimension
        }

        fn provider_name(&self) -> &str {
            "nan"
        }

        fn model_name(&self) -> &str {
            "nan"
        }
    }

    pub(crate) fn nan_client(dimension: usize) -> EmbeddingClient {
        let config = EmbedConfig::hashing(dimension).with_retry(RetryPolicy::no_retry());
        EmbeddingClient::new(Arc::new(NanProvider { dimension }), &config).unwrap()
    }
}
