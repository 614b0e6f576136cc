//! Durable state behind the in-memory index.
//!
//! The index keeps its live state in memory and persists it in two layers:
//!
//! - **Checkpoint**: the full record set plus a [`CollectionMeta`] row holding
//!   the record count, a blake3 checksum and the journal watermark.
//! - **Journal**: one [`JournalEntry`] per mutation since the last checkpoint.
//!
//! ```text
//! VectorIndex ── SnapshotStore ── SqliteSnapshotStore
//!     writes ──► append_journal (every mutation)
//!     timer  ──► checkpoint (records + meta, journal truncated)
//!     open   ──► load (records, verify, replay journal > watermark)
//! ```

use crate::error::Result;
use crate::model::VectorRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod sqlite_store;

pub use sqlite_store::SqliteSnapshotStore;

/// Identity and integrity data for a persisted collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub collection: String,
    /// `provider:model:dimension` of the embedding model that produced the vectors
    pub model_id: String,
    pub dimension: usize,
    /// Highest journal operation folded into the checkpointed records
    pub watermark: u64,
    /// Next record sequence to hand out
    pub next_sequence: u64,
    pub checksum: String,
    pub record_count: usize,
    pub checkpointed_at: Option<DateTime<Utc>>,
}

impl CollectionMeta {
    pub fn new<C: Into<String>, M: Into<String>>(collection: C, model_id: M, dimension: usize) -> Self {
        Self {
            collection: collection.into(),
            model_id: model_id.into(),
            dimension,
            watermark: 0,
            next_sequence: 1,
            checksum: records_checksum(std::iter::empty()),
            record_count: 0,
            checkpointed_at: None,
        }
    }
}

/// A mutation recorded between checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Upsert {
        records: Vec<VectorRecord>,
    },
    DeleteDocument {
        document_id: String,
    },
    ReplaceDocument {
        document_id: String,
        records: Vec<VectorRecord>,
    },
    Clear,
}

impl JournalOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::DeleteDocument { .. } => "delete_document",
            Self::ReplaceDocument { .. } => "replace_document",
            Self::Clear => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub op_id: u64,
    pub op: JournalOp,
}

/// Everything read back from storage on open.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub meta: CollectionMeta,
    pub records: Vec<VectorRecord>,
    /// Entries above the watermark, in op order
    pub journal: Vec<JournalEntry>,
}

/// Persistence operations the index relies on.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the checkpoint and pending journal. `None` for a fresh store.
    async fn load(&self) -> Result<Option<PersistedState>>;

    /// Record the identity of a brand new collection.
    async fn initialize(&self, meta: &CollectionMeta) -> Result<()>;

    /// Durably append one mutation.
    async fn append_journal(&self, entry: &JournalEntry) -> Result<()>;

    /// Replace the checkpointed records and drop journal entries at or below
    /// `meta.watermark`, atomically.
    async fn checkpoint(&self, meta: &CollectionMeta, records: &[Arc<VectorRecord>]) -> Result<()>;

    /// Human readable location for error messages.
    fn location(&self) -> String;
}

/// Hex-encoded blake3 digest over records in sequence order.
pub fn records_checksum<'a, I>(records: I) -> String
where
    I: IntoIterator<Item = &'a VectorRecord>,
{
    let mut hasher = blake3::Hasher::new();
    for record in records {
        hasher.update(&record.sequence.to_le_bytes());
        hasher.update(record.chunk.chunk_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(record.chunk.document_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(record.chunk.chunk_index as u64).to_le_bytes());
        hasher.update(&(record.chunk.start_offset as u64).to_le_bytes());
        hasher.update(&(record.chunk.end_offset as u64).to_le_bytes());
        hasher.update(record.chunk.text.as_bytes());
        hasher.update(&[0]);
        hasher.update(bytemuck::cast_slice(&record.vector));
        // Metadata is a BTreeMap, so the JSON key order is stable.
        if let Ok(metadata) = serde_json::to_vec(&record.chunk.metadata) {
            hasher.update(&metadata);
        }
        hasher.update(&[0]);
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chunk, Metadata};

    fn record(sequence: u64, text: &str) -> VectorRecord {
        VectorRecord {
            sequence,
            chunk: Chunk {
                chunk_id: format!("d_chunk_{sequence:06}"),
                document_id: "d".into(),
                chunk_index: sequence as usize,
                start_offset: 0,
                end_offset: text.chars().count(),
                text: text.into(),
                metadata: Metadata::new(),
            },
            vector: vec![0.5, -0.5],
        }
    }

    #[test]
    fn test_checksum_detects_changes() {
        let a = vec![record(1, "alpha"), record(2, "beta")];
        let mut b = a.clone();
        assert_eq!(records_checksum(&a), records_checksum(&b));

        b[1].vector[0] = 0.25;
        assert_ne!(records_checksum(&a), records_checksum(&b));

        let c = vec![record(1, "alpha"), record(2, "betA")];
        assert_ne!(records_checksum(&a), records_checksum(&c));

        let mut d = a.clone();
        d[0].chunk.metadata.insert("topic".into(), "weather".into());
        assert_ne!(records_checksum(&a), records_checksum(&d));

        let mut e = a.clone();
        e[1].chunk.chunk_index = 7;
        assert_ne!(records_checksum(&a), records_checksum(&e));
        assert_eq!(records_checksum(&a).len(), 64);
    }

    #[test]
    fn test_journal_op_json_shape() {
        let op = JournalOp::DeleteDocument {
            document_id: "doc-1".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "delete_document");
        assert_eq!(json["document_id"], "doc-1");
        let back: JournalOp = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
        assert_eq!(JournalOp::Clear.kind(), "clear");
    }
}
