//! HTTP cross-encoder re-ranking against a minimal in-process server.

use anyhow::Result;
use serde_json::{Value, json};
use sift_embed::{EmbedConfig, EmbeddingClient, RetryPolicy};
use sift_retriever::{
    Document, RetrievalError,
    index::{IndexConfig, VectorIndex},
    retrieval::{
        ChunkingStrategy, HttpCrossEncoder, IngestionConfig, IngestionEngine, QueryBuilder,
        QueryContext, QueryLimits, RerankStage, RetrievalService,
    },
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Handler = Arc<dyn Fn(&Value) -> (u16, String) + Send + Sync>;

struct FakeServer {
    base_url: String,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl FakeServer {
    async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bodies = Arc::new(Mutex::new(Vec::new()));

        let seen = bodies.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    serve_one(stream, handler, seen).await;
                });
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            bodies,
        }
    }
}

async fn serve_one(mut stream: TcpStream, handler: Handler, seen: Arc<Mutex<Vec<Value>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body: Value = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);
    let (status, response) = handler(&body);
    seen.lock().unwrap().push(body);

    let reply = format!(
        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response}",
        response.len()
    );
    let _ = stream.write_all(reply.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Scores each passage by its length, so the longest passage wins.
fn length_scores() -> Handler {
    Arc::new(|body: &Value| {
        let texts = body["texts"].as_array().cloned().unwrap_or_default();
        let scores: Vec<Value> = texts
            .iter()
            .enumerate()
            .rev()
            .map(|(i, t)| json!({"index": i, "score": t.as_str().map_or(0, str::len) as f32 / 100.0}))
            .collect();
        (200, Value::Array(scores).to_string())
    })
}

async fn service_with(stage: RerankStage) -> Result<RetrievalService> {
    let client = EmbeddingClient::from_config(&EmbedConfig::hashing(64))?;
    let index = Arc::new(VectorIndex::open_memory(IndexConfig::for_client("rr", &client)).await?);
    IngestionEngine::new(
        Arc::clone(&index),
        client.clone(),
        ChunkingStrategy::new(Default::default())?,
        IngestionConfig::default(),
    )?
    .ingest(vec![
        Document::new("short", "rainfall"),
        Document::new("long", "rainfall totals for the monsoon season in detail"),
    ])
    .await?;
    let context = QueryContext::new(client, QueryLimits::default())?;
    Ok(RetrievalService::new(index, context, stage))
}

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(attempts)
        .with_delays(Duration::from_millis(1), Duration::from_millis(2))
}

#[tokio::test]
async fn test_http_scores_reorder_results() -> Result<()> {
    let server = FakeServer::start(length_scores()).await;
    let encoder = HttpCrossEncoder::new(
        &server.base_url,
        Some("bge-reranker".to_string()),
        None,
        Duration::from_secs(5),
        fast_retry(1),
    )?;
    let service = service_with(RerankStage::cross_encoder(Arc::new(encoder))).await?;

    let result = service.search(QueryBuilder::new("rainfall").k(2)).await?;
    assert_eq!(result.passages[0].document_id, "long");
    assert_eq!(result.passages[0].score, result.passages[0].rerank_score.unwrap());
    assert_eq!(result.rerank_trace.unwrap().scorer, "http-cross-encoder");

    let bodies = server.bodies.lock().unwrap();
    assert_eq!(bodies[0]["query"], "rainfall");
    assert_eq!(bodies[0]["model"], "bge-reranker");
    assert_eq!(bodies[0]["texts"].as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let inner = length_scores();
    let handler: Handler = Arc::new(move |body: &Value| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            (503, "{\"error\":\"warming up\"}".to_string())
        } else {
            inner(body)
        }
    });
    let server = FakeServer::start(handler).await;
    let encoder = HttpCrossEncoder::new(&server.base_url, None, None, Duration::from_secs(5), fast_retry(3))?;
    let service = service_with(RerankStage::cross_encoder(Arc::new(encoder))).await?;

    let result = service.search(QueryBuilder::new("rainfall").k(2)).await?;
    assert_eq!(result.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_persistent_failure_is_a_rerank_error() -> Result<()> {
    let server = FakeServer::start(Arc::new(|_: &Value| (500, "{}".to_string()))).await;
    let encoder = HttpCrossEncoder::new(&server.base_url, None, None, Duration::from_secs(5), fast_retry(2))?;
    let service = service_with(RerankStage::cross_encoder(Arc::new(encoder))).await?;

    let err = service.search(QueryBuilder::new("rainfall").k(2)).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Rerank { .. }), "{err}");
    Ok(())
}
