//! The vector index: an immutable snapshot behind a generation pointer.
//!
//! ## Concurrency
//!
//! Readers call [`VectorIndex::snapshot`] (or `search`, which does it for
//! them) and get an `Arc<IndexSnapshot>` that never changes underneath them.
//! The pointer lock is held only long enough to clone or swap the `Arc`.
//!
//! Writers serialize on a single async mutex. Each mutation is appended to the
//! journal first, then the next snapshot is built copy-on-write (untouched
//! records are shared) and published in one swap. A reader therefore sees
//! either the whole mutation or none of it.
//!
//! ## Generations
//!
//! Every mutation is one journal operation and one generation, so the
//! generation number equals the id of the last applied operation and survives
//! restarts.

use crate::error::{Result, RetrievalError};
use crate::model::{NewRecord, VectorRecord};
use crate::storage::{
    CollectionMeta, JournalEntry, JournalOp, SnapshotStore, SqliteSnapshotStore, records_checksum,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod checkpoint;
pub mod filter;
pub mod snapshot;

pub use checkpoint::{CheckpointHandle, spawn_checkpointer};
pub use filter::{FilterOp, FilterPredicate};
pub use snapshot::{IndexSnapshot, SearchHit};

/// Identity of the collection an index serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub collection: String,
    /// `provider:model:dimension`, checked against persisted state on open
    pub model_id: String,
    pub dimension: usize,
}

impl IndexConfig {
    pub fn new<C: Into<String>, M: Into<String>>(collection: C, model_id: M, dimension: usize) -> Self {
        Self {
            collection: collection.into(),
            model_id: model_id.into(),
            dimension,
        }
    }

    /// Config matching the model an embedding client talks to.
    pub fn for_client<C: Into<String>>(collection: C, client: &sift_embed::EmbeddingClient) -> Self {
        Self::new(collection, client.model_id(), client.dimension())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub collection: String,
    pub model_id: String,
    pub location: String,
    pub generation: u64,
    pub documents: usize,
    pub chunks: usize,
    pub dimension: usize,
    pub watermark: u64,
    /// Journal operations not yet folded into a checkpoint
    pub pending_ops: u64,
    pub last_checkpoint: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub chunks: usize,
    pub source: Option<String>,
    pub indexed_at: Option<String>,
}

#[derive(Debug)]
struct WriterState {
    next_sequence: u64,
    next_op: u64,
    watermark: u64,
    last_checkpoint: Option<DateTime<Utc>>,
}

impl WriterState {
    fn pending_ops(&self) -> u64 {
        (self.next_op - 1).saturating_sub(self.watermark)
    }
}

pub struct VectorIndex {
    config: IndexConfig,
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<WriterState>,
    store: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("config", &self.config)
            .field("location", &self.store.location())
            .field("generation", &self.snapshot().generation())
            .finish()
    }
}

impl VectorIndex {
    /// Opens the index stored at `path`, creating it when absent.
    pub async fn open(path: &Path, config: IndexConfig) -> Result<Self> {
        let store = SqliteSnapshotStore::open(path).await?;
        Self::with_store(Arc::new(store), config).await
    }

    /// Opens an index backed by an in-memory database.
    pub async fn open_memory(config: IndexConfig) -> Result<Self> {
        let store = SqliteSnapshotStore::open_memory().await?;
        Self::with_store(Arc::new(store), config).await
    }

    /// Loads persisted state from `store`, verifies it and replays the journal.
    pub async fn with_store(store: Arc<dyn SnapshotStore>, config: IndexConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(RetrievalError::configuration("index dimension must be positive"));
        }
        let location = store.location();

        let (snapshot, state) = match store.load().await? {
            None => {
                let meta = CollectionMeta::new(&config.collection, &config.model_id, config.dimension);
                store.initialize(&meta).await?;
                info!(
                    "Created new collection '{}' ({}) at {}",
                    config.collection, config.model_id, location
                );
                let state = WriterState {
                    next_sequence: meta.next_sequence,
                    next_op: 1,
                    watermark: 0,
                    last_checkpoint: None,
                };
                (IndexSnapshot::empty(config.dimension), state)
            }
            Some(persisted) => {
                let meta = persisted.meta;
                if meta.dimension != config.dimension {
                    return Err(RetrievalError::configuration(format!(
                        "collection at {location} holds {}-dimensional vectors but the embedding model produces {}",
                        meta.dimension, config.dimension
                    )));
                }
                if meta.model_id != config.model_id {
                    return Err(RetrievalError::configuration(format!(
                        "collection at {location} was built with model '{}' but '{}' is configured",
                        meta.model_id, config.model_id
                    )));
                }
                if meta.collection != config.collection {
                    warn!(
                        "Collection at {} is named '{}', opening it as '{}'",
                        location, meta.collection, config.collection
                    );
                }

                let mut records = Vec::with_capacity(persisted.records.len());
                for record in persisted.records {
                    if record.vector.len() != config.dimension {
                        return Err(RetrievalError::corruption(
                            &location,
                            format!(
                                "record {} has {} dimensions, expected {}",
                                record.chunk.chunk_id,
                                record.vector.len(),
                                config.dimension
                            ),
                        ));
                    }
                    records.push(Arc::new(record));
                }

                let mut next_sequence = meta.next_sequence;
                let mut last_op = meta.watermark;
                let replayed = persisted.journal.len();
                for entry in persisted.journal {
                    if entry.op_id <= last_op {
                        return Err(RetrievalError::corruption(
                            &location,
                            format!("journal entry {} is out of order", entry.op_id),
                        ));
                    }
                    for record in journal_records(&entry.op) {
                        if record.vector.len() != config.dimension {
                            return Err(RetrievalError::corruption(
                                &location,
                                format!(
                                    "journal entry {} holds a {}-dimensional vector",
                                    entry.op_id,
                                    record.vector.len()
                                ),
                            ));
                        }
                        next_sequence = next_sequence.max(record.sequence + 1);
                    }
                    records = apply_op(&records, entry.op).0;
                    last_op = entry.op_id;
                }

                info!(
                    "Opened collection '{}' at {}: {} records, replayed {} journal entries",
                    config.collection,
                    location,
                    records.len(),
                    replayed
                );
                let state = WriterState {
                    next_sequence,
                    next_op: last_op + 1,
                    watermark: meta.watermark,
                    last_checkpoint: meta.checkpointed_at,
                };
                (
                    IndexSnapshot::from_records(last_op, config.dimension, records),
                    state,
                )
            }
        };

        Ok(Self {
            config,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(state),
            store,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// The current generation. Stable for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: IndexSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Inserts records, replacing any existing record with the same chunk id.
    ///
    /// Returns the sequence number assigned to each record, in input order.
    pub async fn insert(&self, records: Vec<NewRecord>) -> Result<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_vectors(&records)?;

        let mut state = self.writer.lock().await;
        let (records, sequences) = assign_sequences(&mut state, records);
        let count = records.len();
        self.commit(&mut state, JournalOp::Upsert { records }).await?;
        debug!("Inserted {} records", count);
        Ok(sequences)
    }

    /// Removes every record of a document. Returns how many were removed.
    pub async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut state = self.writer.lock().await;
        if !self.contains_document(document_id) {
            return Ok(0);
        }
        let removed = self
            .commit(
                &mut state,
                JournalOp::DeleteDocument {
                    document_id: document_id.to_string(),
                },
            )
            .await?;
        info!("Deleted {} chunks of document {}", removed, document_id);
        Ok(removed)
    }

    /// Swaps every record of a document for `records` in a single generation.
    ///
    /// Returns the number of records removed and the sequences assigned.
    pub async fn replace_document(
        &self,
        document_id: &str,
        records: Vec<NewRecord>,
    ) -> Result<(usize, Vec<u64>)> {
        if let Some(stray) = records.iter().find(|r| r.chunk.document_id != document_id) {
            return Err(RetrievalError::configuration(format!(
                "chunk {} belongs to document {}, not {}",
                stray.chunk.chunk_id, stray.chunk.document_id, document_id
            )));
        }
        self.validate_vectors(&records)?;

        let mut state = self.writer.lock().await;
        let (records, sequences) = assign_sequences(&mut state, records);
        let removed = self
            .commit(
                &mut state,
                JournalOp::ReplaceDocument {
                    document_id: document_id.to_string(),
                    records,
                },
            )
            .await?;
        debug!(
            "Replaced document {}: {} chunks removed, {} inserted",
            document_id,
            removed,
            sequences.len()
        );
        Ok((removed, sequences))
    }

    /// Drops every record. The next checkpoint persists the empty collection.
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.writer.lock().await;
        let removed = self.commit(&mut state, JournalOp::Clear).await?;
        info!("Cleared collection '{}' ({} records)", self.config.collection, removed);
        Ok(removed)
    }

    /// Exact top-k search over the current snapshot.
    pub fn search(
        &self,
        query: &[f32],
        filters: &[FilterPredicate],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.snapshot().search(query, filters, k)
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.snapshot()
            .records_for_document(document_id)
            .next()
            .is_some()
    }

    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        let snapshot = self.snapshot();
        let mut documents: BTreeMap<&str, DocumentSummary> = BTreeMap::new();
        for record in snapshot.records() {
            let summary = documents
                .entry(record.document_id())
                .or_insert_with(|| DocumentSummary {
                    document_id: record.document_id().to_string(),
                    chunks: 0,
                    source: None,
                    indexed_at: None,
                });
            summary.chunks += 1;
            let metadata = &record.chunk.metadata;
            if summary.source.is_none() {
                summary.source = metadata.get("source").and_then(|v| v.as_str()).map(String::from);
            }
            if summary.indexed_at.is_none() {
                summary.indexed_at = metadata
                    .get("indexed_at")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
        }
        documents.into_values().collect()
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.writer.lock().await;
        let snapshot = self.snapshot();
        let documents: HashSet<&str> = snapshot.records().iter().map(|r| r.document_id()).collect();
        IndexStats {
            collection: self.config.collection.clone(),
            model_id: self.config.model_id.clone(),
            location: self.store.location(),
            generation: snapshot.generation(),
            documents: documents.len(),
            chunks: snapshot.len(),
            dimension: self.config.dimension,
            watermark: state.watermark,
            pending_ops: state.pending_ops(),
            last_checkpoint: state.last_checkpoint,
        }
    }

    /// Persists the current snapshot and truncates the journal.
    ///
    /// Returns `false` when there was nothing new to persist.
    pub async fn checkpoint(&self) -> Result<bool> {
        let mut state = self.writer.lock().await;
        if state.pending_ops() == 0 {
            debug!("Checkpoint skipped, no pending operations");
            return Ok(false);
        }

        let snapshot = self.snapshot();
        let now = Utc::now();
        let meta = CollectionMeta {
            collection: self.config.collection.clone(),
            model_id: self.config.model_id.clone(),
            dimension: self.config.dimension,
            watermark: state.next_op - 1,
            next_sequence: state.next_sequence,
            checksum: records_checksum(snapshot.records().iter().map(|r| r.as_ref())),
            record_count: snapshot.len(),
            checkpointed_at: Some(now),
        };
        self.store.checkpoint(&meta, snapshot.records()).await?;

        info!(
            "Checkpoint of '{}' at generation {}: {} records, {} journal entries folded",
            self.config.collection,
            snapshot.generation(),
            snapshot.len(),
            state.pending_ops()
        );
        state.watermark = meta.watermark;
        state.last_checkpoint = Some(now);
        Ok(true)
    }

    fn validate_vectors(&self, records: &[NewRecord]) -> Result<()> {
        for record in records {
            if record.vector.len() != self.config.dimension {
                return Err(RetrievalError::configuration(format!(
                    "chunk {} has a {}-dimensional vector, index expects {}",
                    record.chunk.chunk_id,
                    record.vector.len(),
                    self.config.dimension
                )));
            }
            if record.vector.iter().any(|x| !x.is_finite()) {
                return Err(RetrievalError::configuration(format!(
                    "chunk {} has a non-finite vector component",
                    record.chunk.chunk_id
                )));
            }
        }
        Ok(())
    }

    /// Journals `op`, then publishes the resulting snapshot. Must be called
    /// with the writer lock held.
    async fn commit(&self, state: &mut WriterState, op: JournalOp) -> Result<usize> {
        let op_id = state.next_op;
        self.store
            .append_journal(&JournalEntry {
                op_id,
                op: op.clone(),
            })
            .await?;

        let current = self.snapshot();
        let (records, removed) = apply_op(current.records(), op);
        self.publish(IndexSnapshot::from_records(op_id, self.config.dimension, records));
        state.next_op += 1;
        Ok(removed)
    }
}

fn assign_sequences(state: &mut WriterState, records: Vec<NewRecord>) -> (Vec<VectorRecord>, Vec<u64>) {
    let mut sequences = Vec::with_capacity(records.len());
    let records = records
        .into_iter()
        .map(|record| {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            sequences.push(sequence);
            VectorRecord {
                sequence,
                chunk: record.chunk,
                vector: record.vector,
            }
        })
        .collect();
    (records, sequences)
}

fn journal_records(op: &JournalOp) -> &[VectorRecord] {
    match op {
        JournalOp::Upsert { records } | JournalOp::ReplaceDocument { records, .. } => records,
        JournalOp::DeleteDocument { .. } | JournalOp::Clear => &[],
    }
}

/// Builds the record list that results from applying `op` to `records`.
///
/// Untouched records are shared with the previous generation. Returns the new
/// list and the number of records removed.
fn apply_op(records: &[Arc<VectorRecord>], op: JournalOp) -> (Vec<Arc<VectorRecord>>, usize) {
    match op {
        JournalOp::Upsert { records: added } => {
            let replaced: HashSet<&str> = added.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
            let mut next: Vec<Arc<VectorRecord>> = records
                .iter()
                .filter(|r| !replaced.contains(r.chunk_id()))
                .cloned()
                .collect();
            let removed = records.len() - next.len();
            next.extend(dedup_by_chunk_id(added));
            (next, removed)
        }
        JournalOp::DeleteDocument { document_id } => {
            let next: Vec<Arc<VectorRecord>> = records
                .iter()
                .filter(|r| r.document_id() != document_id)
                .cloned()
                .collect();
            let removed = records.len() - next.len();
            (next, removed)
        }
        JournalOp::ReplaceDocument {
            document_id,
            records: added,
        } => {
            let replaced: HashSet<&str> = added.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
            let mut next: Vec<Arc<VectorRecord>> = records
                .iter()
                .filter(|r| r.document_id() != document_id && !replaced.contains(r.chunk_id()))
                .cloned()
                .collect();
            let removed = records.len() - next.len();
            next.extend(dedup_by_chunk_id(added));
            (next, removed)
        }
        JournalOp::Clear => (Vec::new(), records.len()),
    }
}

/// Within one batch the last record for a chunk id wins.
fn dedup_by_chunk_id(records: Vec<VectorRecord>) -> Vec<Arc<VectorRecord>> {
    let mut seen = HashSet::new();
    let mut kept: Vec<Arc<VectorRecord>> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.chunk.chunk_id.clone()))
        .map(Arc::new)
        .collect();
    kept.reverse();
    kept
}
