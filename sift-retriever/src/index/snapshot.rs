//! Immutable generations of the index and the exact similarity scan.

use super::filter::{FilterPredicate, matches_all};
use crate::error::{Result, RetrievalError};
use crate::model::VectorRecord;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

/// One published generation of the collection.
///
/// Snapshots are never mutated. Writers build the next generation by sharing
/// the untouched `Arc<VectorRecord>`s and swapping the pointer.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    generation: u64,
    dimension: usize,
    /// Ordered by sequence
    records: Vec<Arc<VectorRecord>>,
}

/// A scored record returned from a search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Arc<VectorRecord>,
    pub score: f32,
}

impl SearchHit {
    pub fn chunk_id(&self) -> &str {
        self.record.chunk_id()
    }
}

impl IndexSnapshot {
    pub fn empty(dimension: usize) -> Self {
        Self {
            generation: 0,
            dimension,
            records: Vec::new(),
        }
    }

    pub(crate) fn from_records(
        generation: u64,
        dimension: usize,
        mut records: Vec<Arc<VectorRecord>>,
    ) -> Self {
        records.sort_by_key(|r| r.sequence);
        Self {
            generation,
            dimension,
            records,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Arc<VectorRecord>] {
        &self.records
    }

    pub fn get(&self, chunk_id: &str) -> Option<&Arc<VectorRecord>> {
        self.records.iter().find(|r| r.chunk_id() == chunk_id)
    }

    pub fn records_for_document<'a>(
        &'a self,
        document_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<VectorRecord>> + 'a {
        self.records
            .iter()
            .filter(move |r| r.document_id() == document_id)
    }

    /// Exact top-k cosine search.
    ///
    /// Filters are applied before scoring. Results are ordered by score
    /// descending with ties going to the lower sequence number.
    pub fn search(
        &self,
        query: &[f32],
        filters: &[FilterPredicate],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(RetrievalError::configuration(format!(
                "query vector has {} dimensions, index expects {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = norm(query);
        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
        for (position, record) in self.records.iter().enumerate() {
            if !matches_all(filters, &record.chunk.metadata) {
                continue;
            }
            let candidate = Ranked {
                score: cosine(query, query_norm, &record.vector),
                sequence: record.sequence,
                position,
            };
            if heap.len() < k {
                heap.push(Reverse(candidate));
            } else if heap.peek().is_some_and(|Reverse(worst)| candidate > *worst) {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }

        let mut ranked: Vec<Ranked> = heap.into_iter().map(|Reverse(r)| r).collect();
        ranked.sort_by(|a, b| b.cmp(a));
        Ok(ranked
            .into_iter()
            .map(|r| SearchHit {
                record: self.records[r.position].clone(),
                score: r.score,
            })
            .collect())
    }
}

/// Heap entry. Greater means better: higher score, then lower sequence.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    score: f32,
    sequence: u64,
    position: usize,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity; a zero-norm operand scores 0.
pub(crate) fn cosine(query: &[f32], query_norm: f32, vector: &[f32]) -> f32 {
    let vector_norm = norm(vector);
    if query_norm == 0.0 || vector_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(vector).map(|(a, b)| a * b).sum();
    dot / (query_norm * vector_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chunk, Metadata, chunk_id};

    fn record(sequence: u64, doc: &str, vector: Vec<f32>, topic: &str) -> Arc<VectorRecord> {
        let mut metadata = Metadata::new();
        metadata.insert("topic".into(), topic.into());
        Arc::new(VectorRecord {
            sequence,
            chunk: Chunk {
                chunk_id: chunk_id(doc, sequence as usize),
                document_id: doc.to_string(),
                chunk_index: sequence as usize,
                start_offset: 0,
                end_offset: 1,
                text: format!("record {sequence}"),
                metadata,
            },
            vector,
        })
    }

    fn snapshot() -> IndexSnapshot {
        IndexSnapshot::from_records(
            1,
            2,
            vec![
                record(3, "b", vec![0.0, 1.0], "travel"),
                record(1, "a", vec![1.0, 0.0], "weather"),
                record(2, "a", vec![0.7, 0.7], "weather"),
                record(4, "c", vec![0.0, 0.0], "weather"),
            ],
        )
    }

    #[test]
    fn test_orders_by_cosine() {
        let snap = snapshot();
        let hits = snap.search(&[1.0, 0.1], &[], 3).unwrap();
        let seqs: Vec<u64> = hits.iter().map(|h| h.record.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(hits[0].score > hits[1].score);
        assert!(hits[1].score > hits[2].score);
    }

    #[test]
    fn test_filters_before_ranking() {
        let snap = snapshot();
        let filters = vec![FilterPredicate::eq("topic", "travel")];
        let hits = snap.search(&[1.0, 0.0], &filters, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.sequence, 3);
    }

    #[test]
    fn test_zero_norm_scores_zero() {
        let snap = snapshot();
        let filters = vec![FilterPredicate::eq("topic", "weather")];
        let hits = snap.search(&[0.0, 1.0], &filters, 5).unwrap();
        let zero = hits.iter().find(|h| h.record.sequence == 4).unwrap();
        assert_eq!(zero.score, 0.0);

        let hits = snap.search(&[0.0, 0.0], &[], 5).unwrap();
        assert!(hits.iter().all(|h| h.score == 0.0));
    }

    #[test]
    fn test_ties_prefer_lower_sequence() {
        let snap = IndexSnapshot::from_records(
            1,
            2,
            vec![
                record(9, "x", vec![1.0, 0.0], "t"),
                record(5, "y", vec![2.0, 0.0], "t"),
                record(7, "z", vec![3.0, 0.0], "t"),
            ],
        );
        let hits = snap.search(&[1.0, 0.0], &[], 2).unwrap();
        let seqs: Vec<u64> = hits.iter().map(|h| h.record.sequence).collect();
        assert_eq!(seqs, vec![5, 7]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let snap = snapshot();
        let err = snap.search(&[1.0, 0.0, 0.0], &[], 1).unwrap_err();
        assert!(matches!(err, RetrievalError::Configuration { .. }));
    }

    #[test]
    fn test_k_zero_and_empty() {
        assert!(snapshot().search(&[1.0, 0.0], &[], 0).unwrap().is_empty());
        assert!(IndexSnapshot::empty(2).search(&[1.0, 0.0], &[], 3).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_helpers() {
        let snap = snapshot();
        assert_eq!(snap.records_for_document("a").count(), 2);
        assert!(snap.get(&chunk_id("b", 3)).is_some());
        assert!(snap.get("missing").is_none());
        let seqs: Vec<u64> = snap.records().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}
