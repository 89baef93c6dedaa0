//! ```text
//! Rows ──► chunking::chunk_rows ──► Chunks ──┐
//!                                            │
//!            EmbeddingCache ◄── embeddings ──┤
//!                  │                         │
//!                  └──► vectors ──► index::SimilarityIndex
//!
//! Query ──► embeddings (cache bypass) ──► retrieval::Retriever
//!                                              │
//!        budget::TokenBudgeter ◄── ranked chunks
//!                  │
//!        prompt::PromptTemplate ──► completion boundary ──► Answer + citations
//! ```
//!
//! The engine in [`engine::RagEngine`] wires these stages into one
//! query-answer transaction; both external services (embeddings, chat
//! completion) are injected trait objects so the whole pipeline runs against
//! deterministic fakes in tests.

pub mod budget;
pub mod chunking;
pub mod completion;
pub mod config;
pub mod dataset;
pub mod embeddings;
pub mod engine;
pub mod index;
pub mod prompt;
pub mod retrieval;
pub mod types;

pub use budget::{BudgetedContext, HeuristicTokenCounter, TokenBudgeter, TokenCounter};
pub use chunking::{Chunk, ChunkGrouping, ChunkingOutcome, ChunkingPolicy, chunk_rows};
pub use completion::{CompletionProvider, RemoteCompletionClient};
pub use config::EngineConfig;
pub use dataset::{CellValue, Row, RowId};
pub use embeddings::{
    EmbeddingCache, EmbeddingProvider, MockEmbeddingProvider, RemoteEmbeddingClient,
};
pub use engine::{Answer, AskTelemetry, LoadTelemetry, RagEngine};
pub use index::{ScoredChunk, SimilarityIndex};
pub use prompt::PromptTemplate;
pub use retrieval::{Retriever, RowFilter};
pub use types::RagError;

#[cfg(feature = "tiktoken")]
pub use budget::TiktokenCounter;
