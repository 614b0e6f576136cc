use super::chunking_strategy::ChunkingStrategy;
use crate::error::{Result, RetrievalError};
use crate::index::VectorIndex;
use crate::model::{Chunk, Document, Metadata, NewRecord};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use sift_embed::EmbeddingClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Persist a checkpoint once each `ingest` call finishes
    pub checkpoint_after_ingest: bool,
    /// Documents chunked and embedded at the same time
    pub max_concurrent_documents: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            checkpoint_after_ingest: true,
            max_concurrent_documents: 4,
        }
    }
}

impl IngestionConfig {
    pub fn with_checkpoint_after_ingest(mut self, enabled: bool) -> Self {
        self.checkpoint_after_ingest = enabled;
        self
    }

    pub fn with_max_concurrent_documents(mut self, max: usize) -> Self {
        self.max_concurrent_documents = max.max(1);
        self
    }
}

/// Statistics for the current session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub errors: usize,
}

/// A document or chunk that could not be indexed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkFailure {
    pub document_id: String,
    /// `None` when the whole document was rejected
    pub chunk_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub documents_ingested: usize,
    pub chunks_indexed: usize,
    /// Chunks of earlier versions removed by re-ingestion
    pub chunks_replaced: usize,
    pub failures: Vec<ChunkFailure>,
    pub elapsed: Duration,
}

impl IngestionReport {
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed",
            self.documents_ingested,
            self.failures.len()
        )
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct DocumentOutcome {
    ingested: bool,
    chunks_created: usize,
    chunks_indexed: usize,
    chunks_replaced: usize,
    failures: Vec<ChunkFailure>,
}

/// Chunks, embeds and indexes documents.
pub struct IngestionEngine {
    index: Arc<VectorIndex>,
    embedder: EmbeddingClient,
    chunking: ChunkingStrategy,
    config: IngestionConfig,
    stats: RwLock<ProcessingStats>,
}

impl IngestionEngine {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: EmbeddingClient,
        chunking: ChunkingStrategy,
        config: IngestionConfig,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(RetrievalError::configuration(format!(
                "embedding model {} produces {}-dimensional vectors, index expects {}",
                embedder.model_id(),
                embedder.dimension(),
                index.dimension()
            )));
        }
        if embedder.model_id() != index.config().model_id {
            return Err(RetrievalError::configuration(format!(
                "index was opened for model '{}' but the embedder is '{}'",
                index.config().model_id,
                embedder.model_id()
            )));
        }
        Ok(Self {
            index,
            embedder,
            chunking,
            config,
            stats: RwLock::new(ProcessingStats::default()),
        })
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub async fn get_stats(&self) -> ProcessingStats {
        self.stats.read().await.clone()
    }

    /// Ingest a batch of documents.
    ///
    /// Each document replaces any earlier version atomically. Chunks whose
    /// embedding fails are skipped and listed in the report; configuration
    /// errors abort the batch.
    pub async fn ingest(&self, documents: Vec<Document>) -> Result<IngestionReport> {
        let start = Instant::now();
        let total = documents.len();
        info!("Ingesting {} documents", total);

        let outcomes: Vec<DocumentOutcome> = stream::iter(documents)
            .map(|document| self.ingest_document(document))
            .buffer_unordered(self.config.max_concurrent_documents.max(1))
            .try_collect()
            .await?;

        let mut report = IngestionReport::default();
        let mut stats = self.stats.write().await;
        for outcome in outcomes {
            stats.documents_processed += 1;
            stats.chunks_created += outcome.chunks_created;
            stats.embeddings_generated += outcome.chunks_indexed;
            stats.errors += outcome.failures.len();

            if outcome.ingested {
                report.documents_ingested += 1;
            }
            report.chunks_indexed += outcome.chunks_indexed;
            report.chunks_replaced += outcome.chunks_replaced;
            report.failures.extend(outcome.failures);
        }
        drop(stats);

        if self.config.checkpoint_after_ingest {
            self.index.checkpoint().await?;
        }

        report.elapsed = start.elapsed();
        info!(
            "Ingestion finished in {:?}: {} ({} chunks indexed, {} replaced)",
            report.elapsed,
            report.summary(),
            report.chunks_indexed,
            report.chunks_replaced
        );
        Ok(report)
    }

    /// Load UTF-8 text files and ingest them.
    ///
    /// Directories are walked recursively, honouring `.gitignore`. The
    /// document id is the file path and `source` is the file name.
    pub async fn ingest_paths(
        &self,
        paths: &[PathBuf],
        extra_metadata: &Metadata,
    ) -> Result<IngestionReport> {
        let mut documents = Vec::new();
        let mut load_failures = Vec::new();

        for file in self.collect_files(paths) {
            let document_id = file.display().to_string();
            let bytes = match tokio::fs::read(&file).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read {}: {}", document_id, e);
                    load_failures.push(ChunkFailure {
                        document_id,
                        chunk_id: None,
                        reason: format!("cannot read file: {e}"),
                    });
                    continue;
                }
            };
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Skipping {}: not valid UTF-8", document_id);
                    load_failures.push(ChunkFailure {
                        document_id,
                        chunk_id: None,
                        reason: "file is not valid UTF-8 text".to_string(),
                    });
                    continue;
                }
            };

            let mut metadata = extra_metadata.clone();
            if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
                metadata.insert("source".into(), name.into());
            }
            metadata.insert("path".into(), document_id.clone().into());
            documents.push(Document {
                document_id,
                text,
                metadata,
            });
        }

        let mut report = self.ingest(documents).await?;
        self.stats.write().await.errors += load_failures.len();
        report.failures.splice(0..0, load_failures);
        Ok(report)
    }

    fn collect_files(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_file() {
                // Explicitly named files are always loaded.
                files.push(path.clone());
                continue;
            }
            for entry in ignore::WalkBuilder::new(path).build() {
                match entry {
                    Ok(entry) => {
                        let candidate: &Path = entry.path();
                        if entry.file_type().is_some_and(|t| t.is_file())
                            && self.chunking.should_index_file(candidate)
                        {
                            files.push(candidate.to_path_buf());
                        }
                    }
                    Err(e) => warn!("Error walking {}: {}", path.display(), e),
                }
            }
        }
        files.sort();
        files.dedup();
        files
    }

    async fn ingest_document(&self, document: Document) -> Result<DocumentOutcome> {
        let document_id = document.document_id.clone();
        let reject = |reason: &str| DocumentOutcome {
            failures: vec![ChunkFailure {
                document_id: document_id.clone(),
                chunk_id: None,
                reason: reason.to_string(),
            }],
            ..DocumentOutcome::default()
        };

        if document_id.trim().is_empty() {
            warn!("Skipping document with an empty id");
            return Ok(reject("document id is empty"));
        }
        if document.text.trim().is_empty() {
            warn!("Skipping document {}: no text", document_id);
            return Ok(reject("document has no text"));
        }

        let chunks = self.chunking.chunk_document(&document, Utc::now());
        debug!("Document {} split into {} chunks", document_id, chunks.len());
        let (records, failures) = self.embed_chunks(&document_id, chunks.clone()).await?;

        let mut outcome = DocumentOutcome {
            chunks_created: chunks.len(),
            failures,
            ..DocumentOutcome::default()
        };
        if records.is_empty() {
            // Keep whatever version is already indexed.
            warn!(
                "No chunk of document {} could be embedded, index left unchanged",
                document_id
            );
            return Ok(outcome);
        }

        let indexed = records.len();
        let (removed, _) = self.index.replace_document(&document_id, records).await?;
        outcome.ingested = true;
        outcome.chunks_indexed = indexed;
        outcome.chunks_replaced = removed;
        Ok(outcome)
    }

    /// Embed every chunk, falling back to one request per chunk when the
    /// batch fails so a bad chunk only costs itself.
    async fn embed_chunks(
        &self,
        document_id: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(Vec<NewRecord>, Vec<ChunkFailure>)> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();

        let batch_error = match self.embedder.embed_batch(&texts).await {
            Ok(vectors) => {
                let records = chunks
                    .into_iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| NewRecord::new(chunk, vector))
                    .collect();
                return Ok((records, Vec::new()));
            }
            Err(e) => RetrievalError::from_embed(format!("document {document_id}"), e),
        };
        if batch_error.is_fatal() {
            return Err(batch_error);
        }
        warn!(
            "Batch embedding for document {} failed ({}), retrying chunks individually",
            document_id, batch_error
        );

        let results = futures::future::join_all(chunks.iter().map(|c| self.embedder.embed(&c.text))).await;

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (chunk, result) in chunks.into_iter().zip(results) {
            match result {
                Ok(vector) => records.push(NewRecord::new(chunk, vector)),
                Err(e) => {
                    let error = RetrievalError::from_embed(format!("chunk {}", chunk.chunk_id), e);
                    if error.is_fatal() {
                        return Err(error);
                    }
                    warn!("Skipping chunk {}: {}", chunk.chunk_id, error);
                    failures.push(ChunkFailure {
                        document_id: document_id.to_string(),
                        chunk_id: Some(chunk.chunk_id),
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok((records, failures))
    }
}
