//! In-memory nearest-neighbor index over embedded chunks.
//!
//! Vectors are L2-normalized once at build time, so cosine similarity reduces
//! to a dot product at query time. The index is an immutable snapshot: built
//! once per dataset load, queried read-only, rebuilt wholesale when the
//! dataset or embedding model changes. A linear scan is the baseline
//! algorithm and comfortably covers tens of thousands of chunks.

use serde::{Deserialize, Serialize};

/// One ranked retrieval candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Clone, Debug)]
struct IndexEntry {
    chunk_id: String,
    vector: Vec<f32>,
}

/// Read-only snapshot supporting top-k cosine similarity lookup.
#[derive(Clone, Debug, Default)]
pub struct SimilarityIndex {
    entries: Vec<IndexEntry>,
    dimensions: usize,
}

impl SimilarityIndex {
    /// Builds the index from `(chunk id, vector)` pairs.
    ///
    /// Duplicate chunk ids collapse to their first occurrence (identical text
    /// hashes to an identical id, and one vector per id is all the index
    /// needs). Vectors are normalized here; zero-norm vectors are kept as-is
    /// and score 0 against every query.
    pub fn build(pairs: Vec<(String, Vec<f32>)>) -> Self {
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(pairs.len());
        let mut dimensions = 0;
        for (chunk_id, vector) in pairs {
            if entries.iter().any(|entry| entry.chunk_id == chunk_id) {
                continue;
            }
            if dimensions == 0 {
                dimensions = vector.len();
            }
            entries.push(IndexEntry {
                chunk_id,
                vector: normalized(vector),
            });
        }
        Self {
            entries,
            dimensions,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimensionality of the indexed vectors (0 for an empty index).
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Returns the `k` most similar entries, ordered by descending score with
    /// exact ties broken by the lexicographically smaller chunk id.
    pub fn query(&self, vector: &[f32], k: usize) -> Vec<ScoredChunk> {
        let query = normalized(vector.to_vec());
        let mut candidates: Vec<ScoredChunk> = self
            .entries
            .iter()
            .map(|entry| ScoredChunk {
                chunk_id: entry.chunk_id.clone(),
                score: dot(&query, &entry.vector),
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(k);
        candidates
    }
}

fn normalized(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm >= f32::EPSILON {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
