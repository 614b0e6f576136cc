//! SQLite implementation of [`SnapshotStore`].
//!
//! One database file per collection, opened in WAL mode:
//!
//! - `collection_meta`: a single row with identity, watermark and checksum
//! - `records`: the checkpointed records, embeddings stored as raw f32 blobs
//! - `journal`: JSON-encoded mutations since the last checkpoint

use super::{CollectionMeta, JournalEntry, JournalOp, PersistedState, SnapshotStore, records_checksum};
use crate::error::{Result, RetrievalError};
use crate::model::{Chunk, Metadata, VectorRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
    location: String,
}

impl SqliteSnapshotStore {
    /// Database file for a collection inside `data_dir`.
    pub fn database_path(data_dir: &Path, collection: &str) -> PathBuf {
        data_dir.join(format!("{collection}.sift.db"))
    }

    /// Opens (or creates) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pre_existing = path.exists();
        let location = path.display().to_string();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true),
        )
        .await
        .map_err(|e| classify_open_error(&location, pre_existing, e))?;

        // Failing to open a database that already existed means it is damaged.
        let store = Self { pool, location };
        store
            .create_tables()
            .await
            .map_err(|e| classify_open_error(&store.location, pre_existing, e))?;
        debug!("Opened snapshot store at {}", store.location);
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the database alive.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self {
            pool,
            location: ":memory:".to_string(),
        };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                collection TEXT NOT NULL,
                model_id TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                watermark INTEGER NOT NULL,
                next_sequence INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                record_count INTEGER NOT NULL,
                checkpointed_at TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                sequence INTEGER PRIMARY KEY,
                chunk_id TEXT UNIQUE NOT NULL,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal (
                op_id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_document ON records(document_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn corruption<R: Into<String>>(&self, reason: R) -> RetrievalError {
        RetrievalError::corruption(&self.location, reason)
    }

    /// Decode one column, reporting a wrongly typed cell as corruption.
    fn column<'r, T>(&self, row: &'r SqliteRow, name: &str, owner: &str) -> Result<T>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        row.try_get(name)
            .map_err(|e| self.corruption(format!("column {name} of {owner}: {e}")))
    }

    async fn load_meta(&self) -> Result<Option<CollectionMeta>> {
        let row = sqlx::query(
            r#"
            SELECT collection, model_id, dimension, watermark, next_sequence,
                   checksum, record_count, checkpointed_at
            FROM collection_meta WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.corruption(format!("cannot read collection_meta: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let owner = "collection_meta";
        let dimension: i64 = self.column(&row, "dimension", owner)?;
        let watermark: i64 = self.column(&row, "watermark", owner)?;
        let next_sequence: i64 = self.column(&row, "next_sequence", owner)?;
        let record_count: i64 = self.column(&row, "record_count", owner)?;
        if dimension <= 0 || watermark < 0 || next_sequence <= 0 || record_count < 0 {
            return Err(self.corruption("collection_meta holds negative counters"));
        }
        let checkpointed_at: Option<DateTime<Utc>> = row
            .try_get("checkpointed_at")
            .map_err(|e| self.corruption(format!("bad checkpoint timestamp: {e}")))?;

        Ok(Some(CollectionMeta {
            collection: self.column(&row, "collection", owner)?,
            model_id: self.column(&row, "model_id", owner)?,
            dimension: dimension as usize,
            watermark: watermark as u64,
            next_sequence: next_sequence as u64,
            checksum: self.column(&row, "checksum", owner)?,
            record_count: record_count as usize,
            checkpointed_at,
        }))
    }

    async fn load_records(&self) -> Result<Vec<VectorRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, chunk_id, document_id, chunk_index, start_offset, end_offset,
                   content, metadata, embedding
            FROM records ORDER BY sequence
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.corruption(format!("cannot read records: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let sequence: i64 = self.column(&row, "sequence", "records")?;
            let chunk_id: String = self.column(&row, "chunk_id", &format!("record {sequence}"))?;
            let metadata_json: String = self.column(&row, "metadata", &chunk_id)?;
            let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| {
                self.corruption(format!("metadata of {chunk_id} is not valid JSON: {e}"))
            })?;
            let blob: Vec<u8> = self.column(&row, "embedding", &chunk_id)?;
            if blob.len() % std::mem::size_of::<f32>() != 0 {
                return Err(self.corruption(format!(
                    "embedding of {chunk_id} has {} bytes, not a whole number of f32 values",
                    blob.len()
                )));
            }
            let vector: Vec<f32> = bytemuck::pod_collect_to_vec(&blob);
            let chunk_index: i64 = self.column(&row, "chunk_index", &chunk_id)?;
            let start_offset: i64 = self.column(&row, "start_offset", &chunk_id)?;
            let end_offset: i64 = self.column(&row, "end_offset", &chunk_id)?;
            if chunk_index < 0 || start_offset < 0 || end_offset < start_offset {
                return Err(self.corruption(format!("offsets of {chunk_id} are out of range")));
            }
            let document_id: String = self.column(&row, "document_id", &chunk_id)?;
            let text: String = self.column(&row, "content", &chunk_id)?;

            records.push(VectorRecord {
                sequence: sequence as u64,
                chunk: Chunk {
                    chunk_id,
                    document_id,
                    chunk_index: chunk_index as usize,
                    start_offset: start_offset as usize,
                    end_offset: end_offset as usize,
                    text,
                    metadata,
                },
                vector,
            });
        }
        Ok(records)
    }

    async fn load_journal(&self, watermark: u64) -> Result<Vec<JournalEntry>> {
        let rows = sqlx::query("SELECT op_id, payload FROM journal WHERE op_id > ?1 ORDER BY op_id")
            .bind(watermark as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.corruption(format!("cannot read journal: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let op_id: i64 = self.column(&row, "op_id", "journal")?;
                let payload: String = self.column(&row, "payload", &format!("journal entry {op_id}"))?;
                let op: JournalOp = serde_json::from_str(&payload).map_err(|e| {
                    self.corruption(format!("journal entry {op_id} cannot be decoded: {e}"))
                })?;
                Ok(JournalEntry {
                    op_id: op_id as u64,
                    op,
                })
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        let Some(meta) = self.load_meta().await? else {
            let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| self.corruption(format!("cannot read records: {e}")))?;
            if orphans > 0 {
                return Err(self.corruption(format!(
                    "{orphans} records present without collection metadata"
                )));
            }
            return Ok(None);
        };

        let records = self.load_records().await?;
        if records.len() != meta.record_count {
            return Err(self.corruption(format!(
                "checkpoint lists {} records but {} are stored",
                meta.record_count,
                records.len()
            )));
        }
        let checksum = records_checksum(&records);
        if checksum != meta.checksum {
            return Err(self.corruption(format!(
                "record checksum {checksum} does not match checkpoint checksum {}",
                meta.checksum
            )));
        }
        let journal = self.load_journal(meta.watermark).await?;

        info!(
            "Loaded {} records and {} journal entries from {}",
            records.len(),
            journal.len(),
            self.location
        );
        Ok(Some(PersistedState {
            meta,
            records,
            journal,
        }))
    }

    async fn initialize(&self, meta: &CollectionMeta) -> Result<()> {
        write_meta(&self.pool, meta).await?;
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.op)?;
        sqlx::query("INSERT INTO journal (op_id, kind, payload) VALUES (?1, ?2, ?3)")
            .bind(entry.op_id as i64)
            .bind(entry.op.kind())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn checkpoint(&self, meta: &CollectionMeta, records: &[Arc<VectorRecord>]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM records").execute(&mut *tx).await?;
        for record in records {
            let metadata = serde_json::to_string(&record.chunk.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO records (sequence, chunk_id, document_id, chunk_index,
                                     start_offset, end_offset, content, metadata, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )
            .bind(record.sequence as i64)
            .bind(&record.chunk.chunk_id)
            .bind(&record.chunk.document_id)
            .bind(record.chunk.chunk_index as i64)
            .bind(record.chunk.start_offset as i64)
            .bind(record.chunk.end_offset as i64)
            .bind(&record.chunk.text)
            .bind(metadata)
            .bind(bytemuck::cast_slice::<f32, u8>(&record.vector))
            .execute(&mut *tx)
            .await?;
        }

        write_meta(&mut *tx, meta).await?;
        sqlx::query("DELETE FROM journal WHERE op_id <= ?1")
            .bind(meta.watermark as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(
            "Checkpointed {} records at watermark {} to {}",
            records.len(),
            meta.watermark,
            self.location
        );
        Ok(())
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}

async fn write_meta<'e, E>(executor: E, meta: &CollectionMeta) -> std::result::Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO collection_meta (id, collection, model_id, dimension, watermark,
                                     next_sequence, checksum, record_count, checkpointed_at)
        VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            collection = excluded.collection,
            model_id = excluded.model_id,
            dimension = excluded.dimension,
            watermark = excluded.watermark,
            next_sequence = excluded.next_sequence,
            checksum = excluded.checksum,
            record_count = excluded.record_count,
            checkpointed_at = excluded.checkpointed_at
        "#,
    )
    .bind(&meta.collection)
    .bind(&meta.model_id)
    .bind(meta.dimension as i64)
    .bind(meta.watermark as i64)
    .bind(meta.next_sequence as i64)
    .bind(&meta.checksum)
    .bind(meta.record_count as i64)
    .bind(meta.checkpointed_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn classify_open_error(location: &str, pre_existing: bool, error: sqlx::Error) -> RetrievalError {
    if pre_existing {
        RetrievalError::corruption(location, format!("cannot open index database: {error}"))
    } else {
        RetrievalError::from(error)
    }
}
