//! Restart recovery and integrity checks for on-disk collections.

use anyhow::Result;
use sift_context::ChunkerConfig;
use sift_embed::{EmbedConfig, EmbeddingClient};
use sift_retriever::{
    Document, RetrievalError,
    index::{IndexConfig, VectorIndex, spawn_checkpointer},
    retrieval::{ChunkingStrategy, IngestionConfig, IngestionEngine},
    storage::SqliteSnapshotStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn client(dimension: usize) -> Result<EmbeddingClient> {
    Ok(EmbeddingClient::from_config(&EmbedConfig::hashing(dimension))?)
}

async fn open(path: &Path, client: &EmbeddingClient) -> sift_retriever::Result<Arc<VectorIndex>> {
    Ok(Arc::new(
        VectorIndex::open(path, IndexConfig::for_client("papers", client)).await?,
    ))
}

fn engine(index: &Arc<VectorIndex>, client: &EmbeddingClient, checkpoint: bool) -> Result<IngestionEngine> {
    Ok(IngestionEngine::new(
        Arc::clone(index),
        client.clone(),
        ChunkingStrategy::new(ChunkerConfig::new(200, 20))?,
        IngestionConfig::default().with_checkpoint_after_ingest(checkpoint),
    )?)
}

fn corpus() -> Vec<Document> {
    vec![
        Document::new("alpha", "Alpha covers retrieval. ".repeat(30)).with_metadata("topic", "ir"),
        Document::new("beta", "Beta covers embeddings.").with_metadata("topic", "ml"),
    ]
}

fn chunk_ids(index: &VectorIndex) -> Vec<String> {
    index
        .snapshot()
        .records()
        .iter()
        .map(|r| r.chunk_id().to_string())
        .collect()
}

#[tokio::test]
async fn test_journal_replay_without_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = SqliteSnapshotStore::database_path(dir.path(), "papers");
    let client = client(32)?;

    let (ids, generation) = {
        let index = open(&path, &client).await?;
        engine(&index, &client, false)?.ingest(corpus()).await?;
        index.delete_by_document("beta").await?;
        assert!(index.stats().await.pending_ops > 0);
        (chunk_ids(&index), index.snapshot().generation())
    };

    let reopened = open(&path, &client).await?;
    assert_eq!(chunk_ids(&reopened), ids);
    assert_eq!(reopened.snapshot().generation(), generation);
    assert!(!reopened.contains_document("beta"));
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_then_more_writes() -> Result<()> {
    let dir = tempdir()?;
    let path = SqliteSnapshotStore::database_path(dir.path(), "papers");
    let client = client(32)?;

    let expected = {
        let index = open(&path, &client).await?;
        let engine = engine(&index, &client, true)?;
        engine.ingest(corpus()).await?;
        let stats = index.stats().await;
        assert_eq!(stats.pending_ops, 0);
        assert!(stats.last_checkpoint.is_some());

        // Lands in the journal only.
        engine
            .ingest(vec![Document::new("gamma", "Gamma covers reranking.")])
            .await?;
        index.delete_by_document("alpha").await?;
        chunk_ids(&index)
    };

    let reopened = open(&path, &client).await?;
    assert_eq!(chunk_ids(&reopened), expected);
    let stats = reopened.stats().await;
    assert_eq!(stats.documents, 2);
    assert!(stats.pending_ops > 0);

    assert!(reopened.checkpoint().await?);
    assert!(!reopened.checkpoint().await?);
    assert_eq!(reopened.stats().await.pending_ops, 0);
    Ok(())
}

#[tokio::test]
async fn test_sequences_continue_after_restart() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("seq.sift.db");
    let client = client(16)?;

    let last = {
        let index = open(&path, &client).await?;
        engine(&index, &client, true)?.ingest(corpus()).await?;
        index.snapshot().records().iter().map(|r| r.sequence).max().unwrap_or(0)
    };

    let index = open(&path, &client).await?;
    engine(&index, &client, false)?
        .ingest(vec![Document::new("delta", "Delta arrives later.")])
        .await?;
    let delta = index.snapshot();
    let delta_seq = delta
        .records_for_document("delta")
        .map(|r| r.sequence)
        .min()
        .unwrap_or(0);
    assert!(delta_seq > last);
    Ok(())
}

#[tokio::test]
async fn test_dimension_mismatch_on_reopen_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("dims.sift.db");
    let small = client(16)?;
    {
        let index = open(&path, &small).await?;
        engine(&index, &small, true)?.ingest(corpus()).await?;
    }

    let large = client(32)?;
    let err = open(&path, &large).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Configuration { .. }), "{err}");
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn test_garbage_file_is_reported_as_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken.sift.db");
    std::fs::write(&path, b"definitely not sqlite\n".repeat(512))?;

    let err = open(&path, &client(16)?).await.unwrap_err();
    assert!(matches!(err, RetrievalError::IndexCorruption { .. }), "{err}");
    assert!(err.is_fatal());
    Ok(())
}

async fn run_sql(path: &Path, statement: &str) -> Result<()> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(path))
        .await?;
    sqlx::query(statement).execute(&pool).await?;
    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn test_wrongly_typed_cell_is_reported_as_corruption() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("typed.sift.db");
    let client = client(16)?;
    {
        let index = open(&path, &client).await?;
        engine(&index, &client, true)?.ingest(corpus()).await?;
        assert_eq!(index.stats().await.pending_ops, 0);
    }

    run_sql(&path, "UPDATE records SET chunk_index = 'garbage'").await?;

    let err = open(&path, &client).await.unwrap_err();
    assert!(matches!(err, RetrievalError::IndexCorruption { .. }), "{err}");
    assert!(err.to_string().contains("chunk_index"), "{err}");
    assert!(err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn test_edited_metadata_fails_checksum_on_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("meta.sift.db");
    let client = client(16)?;
    {
        let index = open(&path, &client).await?;
        engine(&index, &client, true)?.ingest(corpus()).await?;
    }

    run_sql(&path, "UPDATE records SET metadata = '{}'").await?;

    let err = open(&path, &client).await.unwrap_err();
    assert!(matches!(err, RetrievalError::IndexCorruption { .. }), "{err}");
    assert!(err.to_string().contains("checksum"), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_background_checkpointer_persists_on_shutdown() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bg.sift.db");
    let client = client(16)?;

    {
        let index = open(&path, &client).await?;
        let handle = spawn_checkpointer(Arc::clone(&index), Duration::from_secs(3600));
        engine(&index, &client, false)?.ingest(corpus()).await?;
        assert!(index.stats().await.pending_ops > 0);
        handle.shutdown().await;
        assert_eq!(index.stats().await.pending_ops, 0);
    }

    let reopened = open(&path, &client).await?;
    assert_eq!(reopened.stats().await.pending_ops, 0);
    assert_eq!(reopened.list_documents().len(), 2);
    Ok(())
}
