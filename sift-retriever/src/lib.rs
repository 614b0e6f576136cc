//! sift-retriever: retrieval-augmented generation indexing and query engine
//!
//! This crate turns documents into embedded chunks, keeps them in a persistent
//! vector index, and answers natural-language queries with ranked, attributed
//! passages ready for answer synthesis.
//!
//! ## Key Modules
//!
//! - **[`index`]**: Snapshot-based vector index, metadata filters and checkpointing
//! - **[`storage`]**: Journal and checkpoint persistence with a SQLite implementation
//! - **[`retrieval`]**: Ingestion engine, query builder, re-ranking and the retrieval service
//! - **[`settings`]**: TOML settings shared by the CLI and library users
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sift_retriever::{
//!     index::{IndexConfig, VectorIndex},
//!     model::Document,
//!     retrieval::{
//!         ChunkingStrategy, IngestionConfig, IngestionEngine, QueryBuilder, QueryContext,
//!         QueryLimits, RerankStage, RetrievalService,
//!     },
//! };
//! use sift_context::ChunkerConfig;
//! use sift_embed::{EmbedConfig, EmbeddingClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = EmbeddingClient::from_config(&EmbedConfig::hashing(256))?;
//! let index = Arc::new(VectorIndex::open_memory(IndexConfig::for_client("docs", &client)).await?);
//!
//! let engine = IngestionEngine::new(
//!     Arc::clone(&index),
//!     client.clone(),
//!     ChunkingStrategy::new(ChunkerConfig::default())?,
//!     IngestionConfig::default(),
//! )?;
//! engine
//!     .ingest(vec![Document::new("sg", "Singapore is hot and humid.").with_metadata("topic", "weather")])
//!     .await?;
//!
//! let service = RetrievalService::new(
//!     index,
//!     QueryContext::new(client, QueryLimits::default())?,
//!     RerankStage::None,
//! );
//! let result = service
//!     .search(QueryBuilder::new("What is the weather in Singapore?").eq("topic", "weather").k(3))
//!     .await?;
//! println!("{}", result.to_context());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Documents → Chunker → EmbeddingClient → VectorIndex ─ journal/checkpoint → SQLite
//!                                              ↓ snapshot
//! Query → QueryBuilder → QueryPlan → RetrievalService → (RerankStage) → RetrievalResult
//! ```

pub mod error;
pub mod index;
pub mod model;
pub mod retrieval;
pub mod settings;
pub mod storage;

pub use error::{Result, RetrievalError};
pub use index::{FilterOp, FilterPredicate, IndexConfig, VectorIndex};
pub use model::{Chunk, Document, Metadata, MetadataValue};
pub use settings::SiftSettings;
