//! Crate-wide error taxonomy.
//!
//! Each pipeline stage owns a typed error (`ChunkingError`,
//! `EmbeddingServiceError`, `SynthesisError`, `TemplateError`); they converge
//! into [`RagError`] at the engine surface so callers can decide whether to
//! retry a whole `load_dataset` or `ask` call from one match.

use thiserror::Error;

pub use crate::chunking::ChunkingError;
pub use crate::completion::SynthesisError;
pub use crate::embeddings::EmbeddingServiceError;
pub use crate::prompt::TemplateError;

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// Bad input data or chunking policy; surfaced before indexing proceeds.
    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    /// The embedding boundary failed terminally; no partial index state was
    /// committed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingServiceError),

    /// A query arrived before any dataset was loaded (or the dataset produced
    /// zero chunks). Distinct from a query that merely finds nothing.
    #[error("similarity index is empty: load a dataset before asking")]
    EmptyIndex,

    /// The chat-completion boundary failed; the transaction's retrieval and
    /// citations are discarded.
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// The prompt template is malformed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The embedding provider returned vectors of the wrong width.
    #[error("provider '{model}' declares {expected} dimensions but returned {returned}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        returned: usize,
    },

    /// Filesystem failure while persisting or loading optional state.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        RagError::Io(err.to_string())
    }
}
