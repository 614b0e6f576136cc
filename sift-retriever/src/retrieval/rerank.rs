//! Optional second-stage re-ranking of similarity candidates.
//!
//! The stage is chosen once when the retrieval service is built. A
//! [`RelevanceScorer`] assigns one relevance score per candidate passage and
//! [`CrossEncoderReranker`] reorders the candidates by it. Re-ranking never
//! adds candidates; it can only reorder and cut the set it was given.

use crate::error::{Result, RetrievalError};
use crate::index::SearchHit;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sift_embed::{EmbedError, RetryPolicy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Scores passages for relevance to a query.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// One score per passage, in passage order.
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}

/// A candidate together with its re-rank score.
#[derive(Debug, Clone)]
pub struct RerankedHit {
    pub hit: SearchHit,
    pub rerank_score: f32,
}

#[derive(Clone)]
pub struct CrossEncoderReranker {
    scorer: Arc<dyn RelevanceScorer>,
}

impl std::fmt::Debug for CrossEncoderReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossEncoderReranker")
            .field("scorer", &self.scorer.name())
            .finish()
    }
}

impl CrossEncoderReranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self { scorer }
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    /// Re-score `candidates` and keep the best `k`.
    ///
    /// Ordered by re-rank score descending, ties by chunk id.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SearchHit>,
        k: usize,
    ) -> Result<Vec<RerankedHit>> {
        if candidates.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let passages: Vec<&str> = candidates.iter().map(|h| h.record.chunk.text.as_str()).collect();
        let scores = self.scorer.score(query, &passages).await?;
        if scores.len() != candidates.len() {
            return Err(RetrievalError::rerank(format!(
                "{} returned {} scores for {} candidates",
                self.scorer.name(),
                scores.len(),
                candidates.len()
            )));
        }
        if let Some(position) = scores.iter().position(|s| !s.is_finite()) {
            return Err(RetrievalError::rerank(format!(
                "{} returned a non-finite score for {}",
                self.scorer.name(),
                candidates[position].chunk_id()
            )));
        }

        let mut reranked: Vec<RerankedHit> = candidates
            .into_iter()
            .zip(scores)
            .map(|(hit, rerank_score)| RerankedHit { hit, rerank_score })
            .collect();
        reranked.sort_by(|a, b| {
            b.rerank_score
                .total_cmp(&a.rerank_score)
                .then_with(|| a.hit.chunk_id().cmp(b.hit.chunk_id()))
        });
        reranked.truncate(k);
        debug!(
            "Re-ranked candidates with {}, kept {}",
            self.scorer.name(),
            reranked.len()
        );
        Ok(reranked)
    }
}

/// The re-ranking stage of a retrieval service.
#[derive(Debug, Clone, Default)]
pub enum RerankStage {
    #[default]
    None,
    CrossEncoder(CrossEncoderReranker),
}

impl RerankStage {
    pub fn cross_encoder(scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self::CrossEncoder(CrossEncoderReranker::new(scorer))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::CrossEncoder(_))
    }

    /// Scorer name, or `None` when re-ranking is off.
    pub fn scorer_name(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::CrossEncoder(reranker) => Some(reranker.scorer_name()),
        }
    }
}

/// Offline relevance: the share of distinct query terms found in the passage.
///
/// Scores are in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct LexicalOverlapScorer {
    token_pattern: Regex,
}

impl LexicalOverlapScorer {
    pub fn new() -> Result<Self> {
        let token_pattern = Regex::new(r"[\p{L}\p{N}]+")
            .map_err(|e| RetrievalError::configuration(format!("bad token pattern: {e}")))?;
        Ok(Self { token_pattern })
    }

    fn tokens(&self, text: &str) -> HashSet<String> {
        let lowered = text.to_lowercase();
        self.token_pattern
            .find_iter(&lowered)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    pub fn score_one(&self, query: &str, passage: &str) -> f32 {
        let query_terms = self.tokens(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let passage_terms = self.tokens(passage);
        let shared = query_terms.intersection(&passage_terms).count();
        shared as f32 / query_terms.len() as f32
    }
}

#[async_trait]
impl RelevanceScorer for LexicalOverlapScorer {
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        Ok(passages.iter().map(|p| self.score_one(query, p)).collect())
    }

    fn name(&self) -> &str {
        "lexical-overlap"
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    raw_scores: bool,
}

#[derive(Deserialize)]
struct RerankScore {
    index: usize,
    score: f32,
}

/// Cross-encoder served over HTTP with a TEI-style `/rerank` endpoint.
///
/// Transient HTTP failures are retried with the same policy type the
/// embedding client uses.
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HttpCrossEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCrossEncoder")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish()
    }
}

impl HttpCrossEncoder {
    pub fn new(
        base_url: &str,
        model: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(RetrievalError::configuration("rerank base_url is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::configuration(format!("cannot build rerank client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/rerank", base_url.trim_end_matches('/')),
            model,
            api_key,
            retry,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request_once(&self, body: &[u8], expected: usize) -> sift_embed::Result<Vec<f32>> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
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
        let parsed: Vec<RerankScore> = serde_json::from_slice(&bytes)
            .map_err(|e| EmbedError::malformed(format!("invalid rerank response: {e}")))?;

        let mut scores = vec![f32::NAN; expected];
        for entry in parsed {
            let slot = scores
                .get_mut(entry.index)
                .ok_or_else(|| EmbedError::malformed(format!("score index {} out of range", entry.index)))?;
            *slot = entry.score;
        }
        if scores.iter().any(|s| s.is_nan()) {
            return Err(EmbedError::malformed("rerank response does not score every passage"));
        }
        Ok(scores)
    }
}

#[async_trait]
impl RelevanceScorer for HttpCrossEncoder {
    async fn score(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::to_vec(&RerankRequest {
            query,
            texts: passages,
            model: self.model.as_deref(),
            raw_scores: false,
        })?;
        self.retry
            .run("rerank request", |_| self.request_once(&body, passages.len()))
            .await
            .map_err(|e| RetrievalError::rerank(format!("{}: {}", self.endpoint, e)))
    }

    fn name(&self) -> &str {
        "http-cross-encoder"
    }
}
