//! Query construction and validation.
//!
//! A [`QueryBuilder`] collects the caller's intent and turns it into an
//! immutable [`QueryPlan`]. All validation happens in [`QueryBuilder::build`]
//! before the query text is embedded, and the embedding is computed exactly
//! once per plan.

use super::templates::QueryTemplates;
use crate::error::{Result, RetrievalError};
use crate::index::{FilterOp, FilterPredicate};
use crate::model::MetadataValue;
use serde::{Deserialize, Serialize};
use sift_embed::{EmbedError, EmbeddingClient};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
}

impl FieldType {
    pub fn accepts(&self, value: &MetadataValue) -> bool {
        match self {
            Self::String => matches!(value, MetadataValue::String(_)),
            Self::Integer => matches!(value, MetadataValue::Integer(_)),
            Self::Float => value.is_numeric(),
            Self::Bool => matches!(value, MetadataValue::Bool(_)),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// Declared metadata fields and their types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataSchema {
    fields: BTreeMap<String, FieldType>,
}

impl MetadataSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field<S: Into<String>>(mut self, name: S, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    /// Adds the fields every chunk carries after ingestion.
    pub fn with_builtin_fields(self) -> Self {
        self.with_field("document_id", FieldType::String)
            .with_field("chunk_index", FieldType::Integer)
            .with_field("total_chunks", FieldType::Integer)
            .with_field("start_offset", FieldType::Integer)
            .with_field("end_offset", FieldType::Integer)
            .with_field("indexed_at", FieldType::String)
            .with_field("source", FieldType::String)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check a predicate's field and operand types against the schema.
    pub fn validate(&self, predicate: &FilterPredicate) -> Result<()> {
        predicate.validate_shape()?;
        let field = predicate.field.as_str();
        let field_type = self.field_type(field).ok_or_else(|| {
            RetrievalError::filter(
                field,
                format!(
                    "unknown field, known fields: {}",
                    self.fields.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            )
        })?;

        let mismatch = |value: &MetadataValue| {
            RetrievalError::filter(
                field,
                format!("field is {field_type} but the filter value '{value}' is {}", value.type_name()),
            )
        };
        match &predicate.op {
            FilterOp::Eq(value) if !field_type.accepts(value) => Err(mismatch(value)),
            FilterOp::In(values) => match values.iter().find(|v| !field_type.accepts(v)) {
                Some(value) => Err(mismatch(value)),
                None => Ok(()),
            },
            FilterOp::Range { .. } if !field_type.is_numeric() => Err(RetrievalError::filter(
                field,
                format!("range filters need a numeric field, this one is {field_type}"),
            )),
            FilterOp::Prefix(_) if field_type != FieldType::String => Err(RetrievalError::filter(
                field,
                format!("prefix filters need a string field, this one is {field_type}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Bounds applied to every query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    pub default_k: usize,
    pub max_k: usize,
    /// Candidates fetched per requested result when re-ranking
    pub rerank_pool_factor: usize,
    pub max_rerank_pool: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_k: 5,
            max_k: 100,
            rerank_pool_factor: 4,
            max_rerank_pool: 200,
        }
    }
}

impl QueryLimits {
    pub fn validate(&self) -> Result<()> {
        if self.default_k == 0 || self.max_k == 0 {
            return Err(RetrievalError::configuration("default_k and max_k must be at least 1"));
        }
        if self.default_k > self.max_k {
            return Err(RetrievalError::configuration(format!(
                "default_k ({}) exceeds max_k ({})",
                self.default_k, self.max_k
            )));
        }
        if self.rerank_pool_factor == 0 {
            return Err(RetrievalError::configuration("rerank_pool_factor must be at least 1"));
        }
        Ok(())
    }
}

/// Everything a [`QueryBuilder`] needs to produce a plan.
#[derive(Debug, Clone)]
pub struct QueryContext {
    embedder: EmbeddingClient,
    limits: QueryLimits,
    schema: Option<MetadataSchema>,
    rerank_enabled: bool,
}

impl QueryContext {
    pub fn new(embedder: EmbeddingClient, limits: QueryLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self {
            embedder,
            limits,
            schema: None,
            rerank_enabled: false,
        })
    }

    pub fn with_schema(mut self, schema: MetadataSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_rerank(mut self, enabled: bool) -> Self {
        self.rerank_enabled = enabled;
        self
    }

    pub fn embedder(&self) -> &EmbeddingClient {
        &self.embedder
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }

    pub fn schema(&self) -> Option<&MetadataSchema> {
        self.schema.as_ref()
    }

    pub fn rerank_enabled(&self) -> bool {
        self.rerank_enabled
    }

    /// How many candidates to pull from the index for a query asking for `k`.
    pub fn candidate_pool(&self, k: usize) -> usize {
        if !self.rerank_enabled {
            return k;
        }
        let ceiling = self.limits.max_rerank_pool.max(k);
        k.saturating_mul(self.limits.rerank_pool_factor).clamp(k, ceiling)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    text: String,
    filters: Vec<FilterPredicate>,
    k: Option<usize>,
    score_threshold: Option<f32>,
}

impl QueryBuilder {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Start from a named template; its `k` becomes the default for this query.
    pub fn from_template(
        templates: &QueryTemplates,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<Self> {
        let (text, k) = templates.render(name, vars)?;
        Ok(Self::new(text).k(k))
    }

    pub fn filter(mut self, predicate: FilterPredicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn filters<I: IntoIterator<Item = FilterPredicate>>(mut self, predicates: I) -> Self {
        self.filters.extend(predicates);
        self
    }

    pub fn eq<F: Into<String>, V: Into<MetadataValue>>(self, field: F, value: V) -> Self {
        self.filter(FilterPredicate::eq(field, value))
    }

    pub fn one_of<F, I, V>(self, field: F, values: I) -> Self
    where
        F: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<MetadataValue>,
    {
        self.filter(FilterPredicate::one_of(field, values))
    }

    pub fn range<F: Into<String>>(self, field: F, min: Option<f64>, max: Option<f64>) -> Self {
        self.filter(FilterPredicate::range(field, min, max))
    }

    pub fn prefix<F: Into<String>, P: Into<String>>(self, field: F, prefix: P) -> Self {
        self.filter(FilterPredicate::prefix(field, prefix))
    }

    /// Restrict results to one document.
    pub fn within_document<S: Into<String>>(self, document_id: S) -> Self {
        self.eq("document_id", document_id.into())
    }

    /// Restrict results to documents loaded from a given source name.
    pub fn within_source<S: Into<String>>(self, source: S) -> Self {
        self.eq("source", source.into())
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    /// Validate everything, then embed the query text once.
    pub async fn build(self, context: &QueryContext) -> Result<QueryPlan> {
        let text = self.text.trim();
        if text.is_empty() {
            return Err(RetrievalError::invalid_query("text", "query text is empty"));
        }

        let limits = context.limits();
        let k = self.k.unwrap_or(limits.default_k);
        if k == 0 || k > limits.max_k {
            return Err(RetrievalError::invalid_query(
                "k",
                format!("k must be between 1 and {}, got {}", limits.max_k, k),
            ));
        }

        if let Some(threshold) = self.score_threshold {
            if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
                return Err(RetrievalError::invalid_query(
                    "score_threshold",
                    format!("threshold must be within [-1, 1], got {threshold}"),
                ));
            }
        }

        for predicate in &self.filters {
            match context.schema() {
                Some(schema) => schema.validate(predicate)?,
                None => predicate.validate_shape()?,
            }
        }

        let embedding = context
            .embedder()
            .embed(text)
            .await
            .map_err(|e| RetrievalError::from_embed("query", e))?;
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(RetrievalError::from_embed(
                "query",
                EmbedError::malformed("query embedding contains non-finite values"),
            ));
        }

        let candidate_pool = context.candidate_pool(k);
        debug!(
            "Built query plan: k={}, pool={}, {} filters",
            k,
            candidate_pool,
            self.filters.len()
        );
        Ok(QueryPlan {
            text: text.to_string(),
            embedding,
            filters: self.filters,
            k,
            score_threshold: self.score_threshold,
            candidate_pool,
        })
    }
}

/// A validated, embedded query. Consumed by the retrieval service.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    text: String,
    embedding: Vec<f32>,
    filters: Vec<FilterPredicate>,
    k: usize,
    score_threshold: Option<f32>,
    candidate_pool: usize,
}

impl QueryPlan {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    pub fn filters(&self) -> &[FilterPredicate] {
        &self.filters
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn score_threshold(&self) -> Option<f32> {
        self.score_threshold
    }

    pub fn candidate_pool(&self) -> usize {
        self.candidate_pool
    }
}
