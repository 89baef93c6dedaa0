//! Engine configuration.
//!
//! Configuration is an explicit value handed to the engine builder, never
//! ambient global state; a changed embedding model is visible as a changed
//! config value, which is what makes cache invalidation and index rebuilds
//! explicit operations.

use serde::{Deserialize, Serialize};

/// The recognized engine options, and only those.
///
/// Unknown keys in a deserialized config are rejected rather than ignored,
/// so a typo cannot silently fall back to a default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Embedding model identifier, used to construct the embedding boundary.
    pub embedding_model: String,
    /// Chat model used for answer synthesis and token counting.
    pub chat_model: String,
    /// Maximum prompt size in tokens, overhead included.
    pub token_budget: usize,
    /// Retrieval depth when `ask` is called without an explicit `k`.
    pub default_k: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_model: "text-embedding-3-small".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            token_budget: 3072,
            default_k: 6,
        }
    }
}
