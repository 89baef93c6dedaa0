//! Embedding boundary: the provider trait, batching, and the vector cache.
//!
//! The engine never talks to an embedding service directly; it goes through
//! the [`EmbeddingProvider`] trait so production code can inject the remote
//! client and tests can inject a deterministic fake.
//!
//! * [`remote`] — OpenAI-compatible HTTP client with retry and backoff.
//! * [`cache`] — content-addressed vector cache keyed by (chunk id, model).

pub mod cache;
pub mod remote;

use async_trait::async_trait;

pub use cache::{EmbeddingCache, EmbeddingRecord};
pub use remote::RemoteEmbeddingClient;

/// Errors crossing the embedding service boundary.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingServiceError {
    /// Transient failures persisted through every allowed attempt.
    #[error("embedding request for model '{model}' failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        model: String,
        attempts: usize,
        reason: String,
    },

    /// The service answered with a non-retryable error status.
    #[error("embedding service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The service returned a different number of vectors than inputs.
    #[error("embedding service returned {returned} vectors for {expected} inputs")]
    CountMismatch { expected: usize, returned: usize },

    /// Request could not be built or sent at all.
    #[error("embedding transport error: {0}")]
    Transport(String),
}

/// An embedding backend: one fixed-dimensionality vector per input text, in
/// input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier of the embedding model (cache keys include it).
    fn model_name(&self) -> &str;

    /// Vector dimensionality for this model.
    fn dimensions(&self) -> usize;

    /// Embeds one bounded batch of texts.
    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingServiceError>;
}

/// Splits `texts` into batches of at most `batch_size` and merges the
/// per-batch results back in input order.
///
/// Each batch's vector count is validated against its input count so a
/// misbehaving backend cannot silently shift vectors onto the wrong texts.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
    let batch_size = batch_size.max(1);
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size) {
        let embedded = provider.embed_batch(batch).await?;
        if embedded.len() != batch.len() {
            return Err(EmbeddingServiceError::CountMismatch {
                expected: batch.len(),
                returned: embedded.len(),
            });
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}

/// Deterministic, offline embedding provider for tests and demos.
///
/// Vectors are seeded from a hash of the input text: identical text always
/// embeds identically, different text almost always differs. The numbers
/// carry no semantics.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dimensions: usize,
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self { dimensions: 8 }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions.max(1);
        self
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn model_name(&self) -> &str {
        "mock-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
        Ok(texts
            .iter()
            .map(|text| hash_seeded_vector(text, self.dimensions))
            .collect())
    }
}

fn hash_seeded_vector(text: &str, dimensions: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let seed = hasher.finish();
    (0..dimensions)
        .map(|i| {
            let bits = seed.rotate_left((i % 8) as u32 * 8) ^ ((i as u64) << 24);
            (bits as f64 / u32::MAX as f64) as f32
        })
        .collect()
}
