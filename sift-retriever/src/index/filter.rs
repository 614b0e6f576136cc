//! Structured metadata predicates evaluated against chunk metadata.

use crate::error::{Result, RetrievalError};
use crate::model::{Metadata, MetadataValue};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// Field equals the value. Integers and floats compare numerically.
    Eq(MetadataValue),
    /// Field equals any of the values
    In(Vec<MetadataValue>),
    /// Numeric field within the inclusive bounds; a missing bound is open
    Range { min: Option<f64>, max: Option<f64> },
    /// String field starts with the prefix
    Prefix(String),
}

impl FilterOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::In(_) => "in",
            Self::Range { .. } => "range",
            Self::Prefix(_) => "prefix",
        }
    }
}

/// A single predicate. A list of predicates is AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub field: String,
    pub op: FilterOp,
}

impl FilterPredicate {
    pub fn eq<F: Into<String>, V: Into<MetadataValue>>(field: F, value: V) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq(value.into()),
        }
    }

    pub fn one_of<F, I, V>(field: F, values: I) -> Self
    where
        F: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<MetadataValue>,
    {
        Self {
            field: field.into(),
            op: FilterOp::In(values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn range<F: Into<String>>(field: F, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Range { min, max },
        }
    }

    pub fn prefix<F: Into<String>, P: Into<String>>(field: F, prefix: P) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Prefix(prefix.into()),
        }
    }

    /// Evaluate against a record's metadata. A missing field never matches.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let Some(value) = metadata.get(&self.field) else {
            return false;
        };
        match &self.op {
            FilterOp::Eq(expected) => values_equal(value, expected),
            FilterOp::In(candidates) => candidates.iter().any(|c| values_equal(value, c)),
            FilterOp::Range { min, max } => match value.as_f64() {
                Some(x) => min.is_none_or(|lo| x >= lo) && max.is_none_or(|hi| x <= hi),
                None => false,
            },
            FilterOp::Prefix(prefix) => value.as_str().is_some_and(|s| s.starts_with(prefix.as_str())),
        }
    }

    /// Check that the predicate is well formed on its own, without a schema.
    pub fn validate_shape(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(RetrievalError::filter(&self.field, "field name is empty"));
        }
        match &self.op {
            FilterOp::Eq(MetadataValue::Float(f)) if !f.is_finite() => {
                Err(RetrievalError::filter(&self.field, "value must be finite"))
            }
            FilterOp::In(values) if values.is_empty() => {
                Err(RetrievalError::filter(&self.field, "'in' needs at least one value"))
            }
            FilterOp::Range { min: None, max: None } => Err(RetrievalError::filter(
                &self.field,
                "range needs at least one bound",
            )),
            FilterOp::Range { min, max } => {
                if min.is_some_and(|v| !v.is_finite()) || max.is_some_and(|v| !v.is_finite()) {
                    return Err(RetrievalError::filter(&self.field, "range bounds must be finite"));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(RetrievalError::filter(
                            &self.field,
                            format!("range minimum {lo} exceeds maximum {hi}"),
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// True when every predicate matches.
pub fn matches_all(filters: &[FilterPredicate], metadata: &Metadata) -> bool {
    filters.iter().all(|f| f.matches(metadata))
}

fn values_equal(actual: &MetadataValue, expected: &MetadataValue) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

impl fmt::Display for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            FilterOp::Eq(v) => write!(f, "{} = {v}", self.field),
            FilterOp::In(values) => write!(f, "{} in [{}]", self.field, values.iter().join(", ")),
            FilterOp::Range { min, max } => {
                let lo = min.map(|v| v.to_string()).unwrap_or_default();
                let hi = max.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "{} in {lo}..{hi}", self.field)
            }
            FilterOp::Prefix(p) => write!(f, "{} ^= {p}", self.field),
        }
    }
}

/// Parses the command-line filter syntax:
///
/// - `field=value` equality
/// - `field=a,b,c` membership
/// - `field^=prefix` string prefix
/// - `field:min..max` inclusive numeric range, either bound may be omitted
impl FromStr for FilterPredicate {
    type Err = RetrievalError;

    fn from_str(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let predicate = if let Some((field, prefix)) = expr.split_once("^=") {
            Self::prefix(field.trim(), prefix)
        } else if let Some((field, value)) = expr.split_once('=') {
            if value.contains(',') {
                Self::one_of(
                    field.trim(),
                    value.split(',').map(|v| MetadataValue::parse_loose(v.trim())),
                )
            } else {
                Self::eq(field.trim(), MetadataValue::parse_loose(value))
            }
        } else if let Some((field, bounds)) = expr.split_once(':') {
            let (lo, hi) = bounds.split_once("..").ok_or_else(|| {
                RetrievalError::filter(field, format!("expected 'min..max' but got '{bounds}'"))
            })?;
            Self::range(field.trim(), parse_bound(field, lo)?, parse_bound(field, hi)?)
        } else {
            return Err(RetrievalError::filter(
                expr,
                "expected field=value, field=a,b, field^=prefix or field:min..max",
            ));
        };
        predicate.validate_shape()?;
        Ok(predicate)
    }
}

fn parse_bound(field: &str, raw: &str) -> Result<Option<f64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| RetrievalError::filter(field, format!("range bound '{raw}' is not a number")))
}
