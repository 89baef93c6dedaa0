//! Query-time retrieval: embed the query, rank candidates, post-filter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chunking::Chunk;
use crate::dataset::{CellValue, Row, RowId};
use crate::embeddings::EmbeddingProvider;
use crate::index::{ScoredChunk, SimilarityIndex};
use crate::types::RagError;

/// Declarative row predicate applied after similarity ranking.
///
/// Filters narrow candidates without re-scoring them: a chunk stays when any
/// of its source rows matches. Column lookups are case-insensitive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    /// Cell equals `value` (case-insensitive, trimmed).
    Equals { column: String, value: String },
    /// Numeric cell is at most `limit`; numeric-looking text counts.
    AtMost { column: String, limit: f64 },
    /// Cell text contains at least one of the keywords (case-insensitive).
    ContainsAny {
        column: String,
        keywords: Vec<String>,
    },
    /// Every inner filter matches.
    All(Vec<RowFilter>),
}

impl RowFilter {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            RowFilter::Equals { column, value } => row
                .get(column)
                .is_some_and(|cell| cell.to_string().trim().eq_ignore_ascii_case(value.trim())),
            RowFilter::AtMost { column, limit } => row
                .get(column)
                .and_then(CellValue::as_number)
                .is_some_and(|number| number <= *limit),
            RowFilter::ContainsAny { column, keywords } => row.get(column).is_some_and(|cell| {
                let haystack = cell.to_string().to_lowercase();
                keywords
                    .iter()
                    .any(|keyword| haystack.contains(&keyword.to_lowercase()))
            }),
            RowFilter::All(filters) => filters.iter().all(|filter| filter.matches(row)),
        }
    }
}

/// Ranks the chunks relevant to one query against a loaded dataset.
///
/// Query embeddings bypass the cache: questions rarely repeat verbatim, so
/// caching them would only grow the key space.
pub struct Retriever<'s> {
    provider: &'s dyn EmbeddingProvider,
    index: &'s SimilarityIndex,
    chunks: &'s HashMap<String, Chunk>,
    rows: &'s HashMap<RowId, Row>,
}

impl<'s> Retriever<'s> {
    pub fn new(
        provider: &'s dyn EmbeddingProvider,
        index: &'s SimilarityIndex,
        chunks: &'s HashMap<String, Chunk>,
        rows: &'s HashMap<RowId, Row>,
    ) -> Self {
        Self {
            provider,
            index,
            chunks,
            rows,
        }
    }

    /// Embeds `query`, ranks the top `k` candidates, and applies the
    /// optional post-filter.
    ///
    /// Returns at most `k` candidates; fewer when the filter removes some or
    /// the index is smaller than `k`. An index with zero chunks is an error
    /// ([`RagError::EmptyIndex`]), distinct from a query that merely finds
    /// nothing.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        if self.index.is_empty() {
            return Err(RagError::EmptyIndex);
        }

        let inputs = vec![query.to_string()];
        let mut vectors = self.provider.embed_batch(&inputs).await?;
        let query_vector = vectors
            .pop()
            .ok_or(crate::embeddings::EmbeddingServiceError::CountMismatch {
                expected: 1,
                returned: 0,
            })?;

        let mut candidates = self.index.query(&query_vector, k);
        if let Some(filter) = filter {
            candidates.retain(|candidate| self.chunk_matches(candidate, filter));
        }
        tracing::debug!(
            query_len = query.len(),
            k,
            candidates = candidates.len(),
            "retrieved candidates"
        );
        Ok(candidates)
    }

    fn chunk_matches(&self, candidate: &ScoredChunk, filter: &RowFilter) -> bool {
        self.chunks
            .get(&candidate.chunk_id)
            .is_some_and(|chunk| {
                chunk.source_rows.iter().any(|row_id| {
                    self.rows
                        .get(row_id)
                        .is_some_and(|row| filter.matches(row))
                })
            })
    }
}
