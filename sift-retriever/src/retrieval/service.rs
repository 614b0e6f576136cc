use super::query::{QueryBuilder, QueryContext, QueryPlan};
use super::rerank::RerankStage;
use crate::error::Result;
use crate::index::{IndexSnapshot, SearchHit, VectorIndex};
use crate::model::Metadata;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// One passage in a retrieval response, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPassage {
    pub chunk_id: String,
    pub document_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub text: String,
    pub metadata: Metadata,
    /// Cosine similarity to the query embedding
    pub similarity: f32,
    pub rerank_score: Option<f32>,
    /// The score used for ranking and thresholding
    pub score: f32,
}

impl RankedPassage {
    fn from_hit(hit: &SearchHit, rerank_score: Option<f32>) -> Self {
        let chunk = &hit.record.chunk;
        Self {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
            text: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
            similarity: hit.score,
            rerank_score,
            score: rerank_score.unwrap_or(hit.score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub chunk_id: String,
    pub score: f32,
}

/// Candidate order before and after re-ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankTrace {
    pub scorer: String,
    pub before: Vec<TraceEntry>,
    pub after: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub filters_applied: Vec<String>,
    /// Generation of the snapshot the query ran against
    pub generation: u64,
    pub passages: Vec<RankedPassage>,
    pub rerank_trace: Option<RerankTrace>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Render the passages as a context block for answer synthesis.
    pub fn to_context(&self) -> String {
        self.passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("Source {} (ID: {}):\n{}", i + 1, p.chunk_id, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub index_generation: u64,
    pub documents: usize,
    pub chunks: usize,
    pub embedding_model: String,
    pub embedding_ok: bool,
    pub embedding_error: Option<String>,
    pub reranker: Option<String>,
}

/// Answers queries against a [`VectorIndex`].
///
/// Stateless between requests apart from the shared index, and never
/// mutates it.
#[derive(Debug, Clone)]
pub struct RetrievalService {
    index: Arc<VectorIndex>,
    context: QueryContext,
    rerank: RerankStage,
}

impl RetrievalService {
    pub fn new(index: Arc<VectorIndex>, context: QueryContext, rerank: RerankStage) -> Self {
        let context = context.with_rerank(rerank.is_enabled());
        Self {
            index,
            context,
            rerank,
        }
    }

    pub fn query_context(&self) -> &QueryContext {
        &self.context
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Build a plan through this service's context, then retrieve.
    pub async fn search(&self, builder: QueryBuilder) -> Result<RetrievalResult> {
        let plan = builder.build(&self.context).await?;
        self.retrieve(plan).await
    }

    /// Execute a plan against one snapshot of the index.
    ///
    /// Filters are applied inside the similarity scan, re-ranking runs on the
    /// candidate pool, and the score threshold is applied to the final score.
    pub async fn retrieve(&self, plan: QueryPlan) -> Result<RetrievalResult> {
        let snapshot: Arc<IndexSnapshot> = self.index.snapshot();
        let hits = snapshot.search(plan.embedding(), plan.filters(), plan.candidate_pool())?;
        debug!(
            "Query '{}' matched {} candidates at generation {}",
            plan.text(),
            hits.len(),
            snapshot.generation()
        );

        let (mut passages, rerank_trace) = match &self.rerank {
            RerankStage::None => {
                let passages: Vec<RankedPassage> =
                    hits.iter().map(|h| RankedPassage::from_hit(h, None)).collect();
                (passages, None)
            }
            RerankStage::CrossEncoder(reranker) => {
                let before: Vec<TraceEntry> = hits
                    .iter()
                    .map(|h| TraceEntry {
                        chunk_id: h.chunk_id().to_string(),
                        score: h.score,
                    })
                    .collect();
                let reranked = reranker.rerank(plan.text(), hits, plan.k()).await?;
                let after: Vec<TraceEntry> = reranked
                    .iter()
                    .map(|r| TraceEntry {
                        chunk_id: r.hit.chunk_id().to_string(),
                        score: r.rerank_score,
                    })
                    .collect();
                let passages = reranked
                    .iter()
                    .map(|r| RankedPassage::from_hit(&r.hit, Some(r.rerank_score)))
                    .collect();
                let trace = RerankTrace {
                    scorer: reranker.scorer_name().to_string(),
                    before,
                    after,
                };
                (passages, Some(trace))
            }
        };

        if let Some(threshold) = plan.score_threshold() {
            passages.retain(|p| p.score >= threshold);
        }
        passages.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        passages.truncate(plan.k());

        Ok(RetrievalResult {
            query: plan.text().to_string(),
            filters_applied: plan.filters().iter().map(|f| f.to_string()).collect(),
            generation: snapshot.generation(),
            passages,
            rerank_trace,
        })
    }

    /// Probe the embedding service and summarize the index.
    pub async fn health(&self) -> HealthReport {
        let snapshot = self.index.snapshot();
        let documents = self.index.list_documents().len();
        let embedder = self.context.embedder();
        let embedding_error = match embedder.health_check().await {
            Ok(()) => None,
            Err(e) => {
                warn!("Embedding health check failed: {}", e);
                Some(e.to_string())
            }
        };
        HealthReport {
            healthy: embedding_error.is_none(),
            index_generation: snapshot.generation(),
            documents,
            chunks: snapshot.len(),
            embedding_model: embedder.model_id().to_string(),
            embedding_ok: embedding_error.is_none(),
            embedding_error,
            reranker: self.rerank.scorer_name().map(String::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexConfig;
    use crate::model::{Chunk, NewRecord, chunk_id};
    use crate::retrieval::query::QueryLimits;
    use crate::retrieval::rerank::LexicalOverlapScorer;
    use crate::retrieval::test_support::counting_client;
    use sift_embed::HashingEmbeddingProvider;

    const DIM: usize = 64;

    async fn service_with(texts: &[(&str, &str)], rerank: RerankStage) -> Result<RetrievalService> {
        let (client, _) = counting_client(DIM);
        let index = Arc::new(VectorIndex::open_memory(IndexConfig::for_client("t", &client)).await?);
        let hasher = HashingEmbeddingProvider::new(DIM).map_err(|e| crate::error::RetrievalError::from_embed("test", e))?;

        let records = texts
            .iter()
            .enumerate()
            .map(|(i, (doc, text))| {
                NewRecord::new(
                    Chunk {
                        chunk_id: chunk_id(doc, i),
                        document_id: doc.to_string(),
                        chunk_index: i,
                        start_offset: 0,
                        end_offset: text.chars().count(),
                        text: text.to_string(),
                        metadata: Metadata::new(),
                    },
                    hasher.embed_sync(text),
                )
            })
            .collect();
        index.insert(records).await?;

        let context = QueryContext::new(client, QueryLimits::default())?;
        Ok(RetrievalService::new(index, context, rerank))
    }

    #[tokio::test]
    async fn test_results_sorted_and_truncated() -> Result<()> {
        let service = service_with(
            &[
                ("a", "hot humid tropical weather"),
                ("b", "cold snowy winter"),
                ("c", "tropical weather forecast"),
            ],
            RerankStage::None,
        )
        .await?;

        let result = service.search(QueryBuilder::new("tropical weather").k(2)).await?;
        assert_eq!(result.len(), 2);
        assert!(result.passages[0].score >= result.passages[1].score);
        assert!(result.rerank_trace.is_none());
        assert!(result.passages.iter().all(|p| p.rerank_score.is_none()));
        assert!(result.passages.iter().all(|p| p.document_id != "b"));
        Ok(())
    }

    #[tokio::test]
    async fn test_threshold_applies_to_final_score() -> Result<()> {
        let service = service_with(
            &[("a", "tropical weather"), ("b", "stock market prices")],
            RerankStage::None,
        )
        .await?;

        let result = service
            .search(QueryBuilder::new("tropical weather").k(5).score_threshold(0.5))
            .await?;
        assert_eq!(result.len(), 1);
        assert!(result.passages.iter().all(|p| p.score >= 0.5));
        Ok(())
    }

    #[tokio::test]
    async fn test_rerank_trace_and_scores() -> Result<()> {
        let stage = RerankStage::cross_encoder(Arc::new(LexicalOverlapScorer::new()?));
        let service = service_with(
            &[
                ("a", "weather weather weather weather"),
                ("b", "Singapore weather is hot"),
                ("c", "nothing relevant"),
            ],
            stage,
        )
        .await?;

        let result = service
            .search(QueryBuilder::new("Singapore weather").k(1))
            .await?;
        assert_eq!(result.len(), 1);
        let top = &result.passages[0];
        assert_eq!(top.document_id, "b");
        assert_eq!(top.rerank_score, Some(1.0));
        assert_eq!(top.score, 1.0);

        let trace = result.rerank_trace.unwrap();
        assert_eq!(trace.scorer, "lexical-overlap");
        assert_eq!(trace.before.len(), 3);
        assert_eq!(trace.after.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_to_context() -> Result<()> {
        let service = service_with(&[("a", "tropical weather")], RerankStage::None).await?;
        let result = service.search(QueryBuilder::new("weather").k(1)).await?;
        assert_eq!(result.to_context(), "Source 1 (ID: a_chunk_000000):\ntropical weather");
        Ok(())
    }

    #[tokio::test]
    async fn test_health() -> Result<()> {
        let service = service_with(&[("a", "x"), ("b", "y")], RerankStage::None).await?;
        let report = service.health().await;
        assert!(report.healthy);
        assert_eq!(report.documents, 2);
        assert_eq!(report.chunks, 2);
        assert!(report.reranker.is_none());
        Ok(())
    }
}
