//! Turning rows into retrievable chunks.
//!
//! Chunking is the determinism anchor for the whole pipeline: the same rows
//! under the same [`ChunkingPolicy`] must render to byte-identical text, which
//! makes chunk identifiers (SHA-256 of the rendered text) reproducible and the
//! embedding cache content-addressed.

use std::fmt::Write as _;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::budget::TokenCounter;
use crate::dataset::{Row, RowId};

/// Errors raised while validating a policy or deriving row identity.
#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    /// The declared row group size was zero.
    #[error("row group size must be at least 1")]
    InvalidGroupSize,

    /// A declared key column is absent (or empty) on some row.
    #[error("key column '{column}' missing on row at position {position}")]
    MissingKeyColumn {
        /// The declared key column name.
        column: String,
        /// Zero-based position of the offending row.
        position: usize,
    },
}

/// How many rows make up one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkGrouping {
    /// One chunk per source row.
    PerRow,
    /// Fixed-size groups of consecutive rows; the final group may be shorter.
    FixedSize(usize),
}

impl Default for ChunkGrouping {
    fn default() -> Self {
        Self::PerRow
    }
}

/// Declarative chunking policy.
///
/// `columns` restricts rendering to a subset of columns (matched
/// case-insensitively); `key_column` names the column that supplies stable
/// row identifiers. Without a key column, a row's zero-based position is its
/// identifier.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    #[serde(default)]
    pub grouping: ChunkGrouping,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub key_column: Option<String>,
}

impl ChunkingPolicy {
    fn group_size(&self) -> Result<usize, ChunkingError> {
        match self.grouping {
            ChunkGrouping::PerRow => Ok(1),
            ChunkGrouping::FixedSize(0) => Err(ChunkingError::InvalidGroupSize),
            ChunkGrouping::FixedSize(size) => Ok(size),
        }
    }

    fn renders_column(&self, column: &str) -> bool {
        match &self.columns {
            None => true,
            Some(subset) => subset
                .iter()
                .any(|name| name.trim().eq_ignore_ascii_case(column.trim())),
        }
    }
}

/// A retrievable unit of text derived from one or more source rows.
///
/// The identifier is a content hash of the rendered text, so identical text
/// always carries the identical identifier. The token count is computed on
/// first use and cached for the budgeter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_rows: Vec<RowId>,
    pub text: String,
    #[serde(skip)]
    token_count: OnceLock<usize>,
}

impl Chunk {
    fn new(text: String, source_rows: Vec<RowId>) -> Self {
        Self {
            id: content_hash(&text),
            source_rows,
            text,
            token_count: OnceLock::new(),
        }
    }

    /// Exact token count of this chunk's text under `counter`, cached after
    /// the first call.
    pub fn token_count(&self, counter: &dyn TokenCounter) -> usize {
        *self
            .token_count
            .get_or_init(|| counter.count_tokens(&self.text))
    }
}

/// Summary statistics for one chunking run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ChunkingStats {
    pub total_rows: usize,
    pub total_chunks: usize,
    pub empty_chunks: usize,
}

/// Chunks plus the identified rows they were derived from.
#[derive(Clone, Debug)]
pub struct ChunkingOutcome {
    pub chunks: Vec<Chunk>,
    pub rows: Vec<(RowId, Row)>,
    pub stats: ChunkingStats,
}

/// Splits `rows` into chunks according to `policy`.
///
/// Rows whose rendered text is empty (all cells empty, or emptied by the
/// column subset) still produce a chunk, so every row stays reachable for
/// citation.
pub fn chunk_rows(rows: &[Row], policy: &ChunkingPolicy) -> Result<ChunkingOutcome, ChunkingError> {
    let group_size = policy.group_size()?;

    let mut identified = Vec::with_capacity(rows.len());
    for (position, row) in rows.iter().enumerate() {
        let id = derive_row_id(row, position, policy.key_column.as_deref())?;
        identified.push((id, row.clone()));
    }

    let mut chunks = Vec::new();
    let mut empty_chunks = 0usize;
    for group in identified.chunks(group_size) {
        let text = group
            .iter()
            .map(|(_, row)| render_row(row, policy))
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            empty_chunks += 1;
        }
        let source_rows = group.iter().map(|(id, _)| id.clone()).collect();
        chunks.push(Chunk::new(text, source_rows));
    }

    let stats = ChunkingStats {
        total_rows: rows.len(),
        total_chunks: chunks.len(),
        empty_chunks,
    };
    tracing::debug!(
        rows = stats.total_rows,
        chunks = stats.total_chunks,
        empty = stats.empty_chunks,
        "chunked dataset"
    );

    Ok(ChunkingOutcome {
        chunks,
        rows: identified,
        stats,
    })
}

fn derive_row_id(
    row: &Row,
    position: usize,
    key_column: Option<&str>,
) -> Result<RowId, ChunkingError> {
    match key_column {
        None => Ok(position.to_string()),
        Some(column) => match row.get(column) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(ChunkingError::MissingKeyColumn {
                column: column.to_string(),
                position,
            }),
        },
    }
}

/// Renders one row as `column: value` pairs joined with `"; "`.
///
/// Empty cells are dropped from the rendering (a fully empty row renders to
/// the empty string). The rule is deliberately simple so the rendering, and
/// with it the chunk identifier, is reproducible.
fn render_row(row: &Row, policy: &ChunkingPolicy) -> String {
    row.cells()
        .filter(|(column, value)| policy.renders_column(column) && !value.is_empty())
        .map(|(column, value)| format!("{}: {}", column.trim(), value))
        .collect::<Vec<_>>()
        .join("; ")
}

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
