//! File-based settings for the `sift` binary and embedders of the library.
//!
//! Settings live in a TOML file with one table per component:
//!
//! ```toml
//! [index]
//! data_dir = "./sift-data"
//! collection = "rag_documents"
//!
//! [chunking]
//! chunk_size = 1024
//! overlap = 50
//!
//! [embedding]
//! provider = "http"
//! base_url = "http://localhost:8080/v1"
//! model_name = "nv-embedqa-e5-v5"
//! dimension = 1024
//! api_key_env = "EMBEDDING_API_KEY"
//!
//! [query]
//! default_k = 5
//! schema = { topic = "string", year = "integer" }
//!
//! [rerank]
//! enabled = true
//! kind = "lexical"
//! ```
//!
//! Every table and key is optional.

use crate::error::{Result, RetrievalError};
use crate::index::{IndexConfig, VectorIndex};
use crate::retrieval::{
    HttpCrossEncoder, LexicalOverlapScorer, MetadataSchema, QueryLimits, RerankStage,
};
use crate::storage::sqlite_store::SqliteSnapshotStore;
use serde::{Deserialize, Serialize};
use sift_context::{ChunkerConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use sift_embed::{EmbedConfig, EmbeddingClient, RetryPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub data_dir: PathBuf,
    pub collection: String,
    pub checkpoint_after_ingest: bool,
    /// Background checkpoint period; 0 disables the background task
    pub checkpoint_interval_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./sift-data"),
            collection: "rag_documents".to_string(),
            checkpoint_after_ingest: true,
            checkpoint_interval_secs: 30,
        }
    }
}

/// Chunking parameters. The snapping bounds are derived from the window
/// unless set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: Option<usize>,
    pub lookback: Option<usize>,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
            min_chunk_size: None,
            lookback: None,
        }
    }
}

impl ChunkingSettings {
    pub fn chunker_config(&self) -> ChunkerConfig {
        let mut config = ChunkerConfig::new(self.chunk_size, self.overlap);
        if let Some(min_chunk_size) = self.min_chunk_size {
            config = config.with_min_chunk_size(min_chunk_size);
        }
        if let Some(lookback) = self.lookback {
            config = config.with_lookback(lookback);
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub default_k: usize,
    pub max_k: usize,
    pub max_rerank_pool: usize,
    /// Declared metadata fields; filters on undeclared fields are rejected
    /// when this is non-empty
    pub schema: MetadataSchema,
}

impl Default for QuerySettings {
    fn default() -> Self {
        let limits = QueryLimits::default();
        Self {
            default_k: limits.default_k,
            max_k: limits.max_k,
            max_rerank_pool: limits.max_rerank_pool,
            schema: MetadataSchema::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankKind {
    /// Local token-overlap scoring
    #[default]
    Lexical,
    /// A cross-encoder served over HTTP
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub enabled: bool,
    pub kind: RerankKind,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    /// Candidates fetched per requested result
    pub pool_factor: usize,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: RerankKind::Lexical,
            base_url: None,
            model: None,
            api_key_env: None,
            pool_factor: QueryLimits::default().rerank_pool_factor,
            request_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftSettings {
    pub index: IndexSettings,
    pub chunking: ChunkingSettings,
    pub embedding: EmbedConfig,
    pub query: QuerySettings,
    pub rerank: RerankSettings,
    pub logging: LoggingSettings,
}

impl SiftSettings {
    /// Read settings from `path`.
    ///
    /// A missing file yields the defaults, an unreadable or malformed one is a
    /// configuration error naming the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|e| {
            RetrievalError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings = Self::from_toml(&raw).map_err(|e| match e {
            RetrievalError::Configuration { reason } => {
                RetrievalError::configuration(format!("{}: {reason}", path.display()))
            }
            other => other,
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw)
            .map_err(|e| RetrievalError::configuration(format!("malformed settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RetrievalError::configuration(format!("cannot serialize settings: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.chunker_config().validate()?;
        self.embedding
            .validate()
            .map_err(|e| RetrievalError::from_embed("embedding settings", e))?;
        self.query_limits().validate()?;
        self.rerank
            .retry
            .validate()
            .map_err(|e| RetrievalError::from_embed("rerank settings", e))?;
        if self.index.collection.trim().is_empty() {
            return Err(RetrievalError::configuration("index.collection is empty"));
        }
        if self.rerank.enabled && self.rerank.kind == RerankKind::Http && self.rerank.base_url.is_none() {
            return Err(RetrievalError::configuration(
                "rerank.kind is \"http\" but rerank.base_url is not set",
            ));
        }
        Ok(())
    }

    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.index.data_dir = data_dir.into();
        self
    }

    pub fn with_collection<S: Into<String>>(mut self, collection: S) -> Self {
        self.index.collection = collection.into();
        self
    }

    pub fn embedding_client(&self) -> Result<EmbeddingClient> {
        EmbeddingClient::from_config(&self.embedding)
            .map_err(|e| RetrievalError::from_embed("embedding settings", e))
    }

    /// Open (or create) the configured collection for `client`'s model.
    pub async fn open_index(&self, client: &EmbeddingClient) -> Result<VectorIndex> {
        let config = IndexConfig::for_client(&self.index.collection, client);
        VectorIndex::open(&self.db_path(), config).await
    }

    /// Location of the collection's database file.
    pub fn db_path(&self) -> PathBuf {
        SqliteSnapshotStore::database_path(&self.index.data_dir, &self.index.collection)
    }

    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            default_k: self.query.default_k,
            max_k: self.query.max_k,
            rerank_pool_factor: self.rerank.pool_factor,
            max_rerank_pool: self.query.max_rerank_pool,
        }
    }

    /// The declared schema plus the fields every chunk carries, or `None`
    /// when no fields were declared.
    pub fn schema(&self) -> Option<MetadataSchema> {
        if self.query.schema.is_empty() {
            None
        } else {
            Some(self.query.schema.clone().with_builtin_fields())
        }
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        match self.index.checkpoint_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Resolve the configured re-ranking stage.
    ///
    /// `force` overrides `rerank.enabled` when set.
    pub fn build_rerank_stage(&self, force: Option<bool>) -> Result<RerankStage> {
        if !force.unwrap_or(self.rerank.enabled) {
            return Ok(RerankStage::None);
        }
        match self.rerank.kind {
            RerankKind::Lexical => Ok(RerankStage::cross_encoder(Arc::new(LexicalOverlapScorer::new()?))),
            RerankKind::Http => {
                let base_url = self.rerank.base_url.as_deref().ok_or_else(|| {
                    RetrievalError::configuration("rerank.base_url is required for the http reranker")
                })?;
                let api_key = self
                    .rerank
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok());
                let encoder = HttpCrossEncoder::new(
                    base_url,
                    self.rerank.model.clone(),
                    api_key,
                    Duration::from_millis(self.rerank.request_timeout_ms),
                    self.rerank.retry.clone(),
                )?;
                Ok(RerankStage::cross_encoder(Arc::new(encoder)))
            }
        }
    }
}
