//! The query engine: dataset loading and one-shot question answering.
//!
//! [`RagEngine`] owns the loaded dataset snapshot and the embedding cache and
//! orchestrates retrieve → budget → assemble → synthesize per question. Each
//! question is an ephemeral transaction; nothing about it outlives the
//! returned [`Answer`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::budget::{HeuristicTokenCounter, TokenBudgeter, TokenCounter};
use crate::chunking::{Chunk, ChunkingPolicy, chunk_rows};
use crate::completion::CompletionProvider;
use crate::config::EngineConfig;
use crate::dataset::{Row, RowId};
use crate::embeddings::{EmbeddingCache, EmbeddingProvider, embed_in_batches};
use crate::index::SimilarityIndex;
use crate::prompt::PromptTemplate;
use crate::retrieval::{Retriever, RowFilter};
use crate::types::RagError;

const DEFAULT_EMBED_BATCH_SIZE: usize = 64;

/// The synthesized answer with its provenance.
#[derive(Clone, Debug)]
pub struct Answer {
    pub answer: String,
    /// Source rows behind the context, in rank order, deduplicated.
    pub cited_rows: Vec<RowId>,
    /// Retrieved candidates dropped for budget reasons.
    pub excluded_chunk_count: usize,
    pub telemetry: AskTelemetry,
}

/// Stats for one dataset load.
#[derive(Clone, Copy, Debug)]
pub struct LoadTelemetry {
    pub chunk_count: usize,
    pub empty_chunks: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub dimensions: usize,
    pub duration_ms: u64,
}

/// Stats for one query transaction.
#[derive(Clone, Copy, Debug)]
pub struct AskTelemetry {
    pub transaction_id: Uuid,
    pub retrieved: usize,
    pub context_chunks: usize,
    pub excluded_chunks: usize,
    /// Accounted prompt size: context tokens plus template overhead.
    pub prompt_tokens: usize,
    pub duration_ms: u64,
}

/// One loaded dataset: rows, chunks, and the index over their vectors.
///
/// Immutable once built; replaced wholesale by the next load.
struct DatasetState {
    rows: HashMap<RowId, Row>,
    chunks: HashMap<String, Chunk>,
    index: SimilarityIndex,
}

/// Retrieval-augmented query engine over tabular rows.
pub struct RagEngine {
    config: EngineConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    completer: Arc<dyn CompletionProvider>,
    counter: Arc<dyn TokenCounter>,
    template: PromptTemplate,
    embed_batch_size: usize,
    cache: EmbeddingCache,
    dataset: Option<DatasetState>,
}

impl RagEngine {
    /// Create a new builder for constructing a `RagEngine`.
    pub fn builder() -> RagEngineBuilder {
        RagEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The engine-lifetime embedding cache.
    ///
    /// Exposed so callers can persist it between runs or invalidate a model
    /// explicitly.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Swaps the embedding provider, invalidating the old provider's cached
    /// vectors and dropping the now-stale index.
    ///
    /// The next [`load_dataset`](Self::load_dataset) re-embeds and rebuilds.
    pub fn set_embedding_provider(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        let removed = self.cache.invalidate_model(self.embedder.model_name());
        tracing::info!(
            old_model = self.embedder.model_name(),
            new_model = provider.model_name(),
            invalidated = removed,
            "embedding provider changed"
        );
        self.embedder = provider;
        self.dataset = None;
    }

    /// Chunks `rows` under `policy`, embeds what the cache does not already
    /// hold, and swaps in a freshly built similarity index.
    ///
    /// The build is staged: on any failure the previous dataset and the
    /// cache are left exactly as they were. Newly computed vectors are
    /// committed to the cache only after every batch has succeeded.
    pub async fn load_dataset(
        &mut self,
        rows: Vec<Row>,
        policy: &ChunkingPolicy,
    ) -> Result<LoadTelemetry, RagError> {
        let started = Instant::now();
        let model = self.embedder.model_name().to_string();
        let outcome = chunk_rows(&rows, policy)?;

        // Identical text hashes to an identical id; keep the first occurrence.
        let mut chunk_map: HashMap<String, Chunk> = HashMap::with_capacity(outcome.chunks.len());
        let mut ordered_ids: Vec<String> = Vec::with_capacity(outcome.chunks.len());
        for chunk in outcome.chunks {
            if !chunk_map.contains_key(&chunk.id) {
                ordered_ids.push(chunk.id.clone());
                chunk_map.insert(chunk.id.clone(), chunk);
            }
        }

        let mut vectors: HashMap<String, Vec<f32>> = HashMap::with_capacity(ordered_ids.len());
        let mut misses: Vec<String> = Vec::new();
        for id in &ordered_ids {
            match self.cache.get(id, &model) {
                Some(vector) => {
                    vectors.insert(id.clone(), vector);
                }
                None => misses.push(id.clone()),
            }
        }
        let cache_hits = ordered_ids.len() - misses.len();

        let texts: Vec<String> = misses.iter().map(|id| chunk_map[id].text.clone()).collect();
        let embedded =
            embed_in_batches(self.embedder.as_ref(), &texts, self.embed_batch_size).await?;
        let expected = self.embedder.dimensions();
        for (id, vector) in misses.iter().zip(&embedded) {
            if vector.len() != expected {
                return Err(RagError::DimensionMismatch {
                    model,
                    expected,
                    returned: vector.len(),
                });
            }
            vectors.insert(id.clone(), vector.clone());
        }

        // Every batch succeeded; only now does the cache learn the new vectors.
        for (id, vector) in misses.iter().zip(embedded) {
            self.cache.put(id.clone(), model.clone(), vector);
        }

        let pairs: Vec<(String, Vec<f32>)> = ordered_ids
            .iter()
            .map(|id| (id.clone(), vectors[id].clone()))
            .collect();
        let index = SimilarityIndex::build(pairs);

        let telemetry = LoadTelemetry {
            chunk_count: outcome.stats.total_chunks,
            empty_chunks: outcome.stats.empty_chunks,
            cache_hits,
            cache_misses: misses.len(),
            dimensions: index.dimensions(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            chunks = telemetry.chunk_count,
            cache_hits = telemetry.cache_hits,
            cache_misses = telemetry.cache_misses,
            duration_ms = telemetry.duration_ms,
            model = %model,
            "dataset indexed"
        );

        self.dataset = Some(DatasetState {
            rows: outcome.rows.into_iter().collect(),
            chunks: chunk_map,
            index,
        });
        Ok(telemetry)
    }

    /// Answers `query` with the configured retrieval depth and no filter.
    pub async fn ask(&self, query: &str) -> Result<Answer, RagError> {
        self.ask_with(query, None, None).await
    }

    /// Answers `query`, optionally overriding the retrieval depth and
    /// narrowing candidates with a row filter.
    ///
    /// Fails with [`RagError::EmptyIndex`] before any dataset is loaded. A
    /// failure at the completion boundary discards the whole transaction;
    /// no partial answer or citation survives it.
    pub async fn ask_with(
        &self,
        query: &str,
        k: Option<usize>,
        filter: Option<&RowFilter>,
    ) -> Result<Answer, RagError> {
        let started = Instant::now();
        let transaction_id = Uuid::new_v4();
        let dataset = self.dataset.as_ref().ok_or(RagError::EmptyIndex)?;
        let k = k.unwrap_or(self.config.default_k);

        let retriever = Retriever::new(
            self.embedder.as_ref(),
            &dataset.index,
            &dataset.chunks,
            &dataset.rows,
        );
        let ranked = retriever.retrieve(query, k, filter).await?;
        let retrieved = ranked.len();

        let ranked_chunks: Vec<Chunk> = ranked
            .iter()
            .filter_map(|candidate| dataset.chunks.get(&candidate.chunk_id).cloned())
            .collect();

        let overhead = self.template.overhead_tokens(query, self.counter.as_ref());
        let budgeter = TokenBudgeter::new(self.counter.as_ref(), self.config.token_budget);
        let context = budgeter.select(ranked_chunks, overhead);

        let prompt = self.template.assemble(&context, query);
        let answer = self.completer.complete(&prompt.text).await?;

        let telemetry = AskTelemetry {
            transaction_id,
            retrieved,
            context_chunks: context.chunks.len(),
            excluded_chunks: context.excluded_chunks,
            prompt_tokens: context.context_tokens + context.overhead_tokens,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            %transaction_id,
            retrieved,
            context_chunks = telemetry.context_chunks,
            excluded = telemetry.excluded_chunks,
            prompt_tokens = telemetry.prompt_tokens,
            "query answered"
        );

        Ok(Answer {
            answer,
            cited_rows: prompt.cited_rows(),
            excluded_chunk_count: context.excluded_chunks,
            telemetry,
        })
    }
}

/// Builder for [`RagEngine`].
#[derive(Default)]
pub struct RagEngineBuilder {
    config: Option<EngineConfig>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    completer: Option<Arc<dyn CompletionProvider>>,
    counter: Option<Arc<dyn TokenCounter>>,
    template: Option<PromptTemplate>,
    embed_batch_size: Option<usize>,
}

impl RagEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding boundary. Required.
    #[must_use]
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(provider);
        self
    }

    /// Set the chat-completion boundary. Required.
    #[must_use]
    pub fn completion_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.completer = Some(provider);
        self
    }

    /// Override the token counter.
    ///
    /// Defaults to the exact tiktoken counter for the configured chat model
    /// when available, falling back to the character heuristic.
    #[must_use]
    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    #[must_use]
    pub fn template(mut self, template: PromptTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Batch size for indexing-time embedding calls.
    #[must_use]
    pub fn embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = Some(size.max(1));
        self
    }

    /// Build the [`RagEngine`].
    ///
    /// # Panics
    ///
    /// Panics when either provider is missing; use
    /// [`try_build`](Self::try_build) for a fallible variant.
    pub fn build(self) -> RagEngine {
        self.try_build()
            .expect("RagEngineBuilder requires embedding and completion providers")
    }

    /// Build the [`RagEngine`], returning `None` when a provider is missing.
    pub fn try_build(self) -> Option<RagEngine> {
        let config = self.config.unwrap_or_default();
        let counter = self
            .counter
            .unwrap_or_else(|| default_counter(&config.chat_model));
        Some(RagEngine {
            embedder: self.embedder?,
            completer: self.completer?,
            counter,
            template: self.template.unwrap_or_default(),
            embed_batch_size: self.embed_batch_size.unwrap_or(DEFAULT_EMBED_BATCH_SIZE),
            cache: EmbeddingCache::new(),
            dataset: None,
            config,
        })
    }
}

#[cfg_attr(not(feature = "tiktoken"), allow(unused_variables))]
fn default_counter(chat_model: &str) -> Arc<dyn TokenCounter> {
    #[cfg(feature = "tiktoken")]
    {
        if let Some(counter) = crate::budget::TiktokenCounter::for_model(chat_model) {
            return Arc::new(counter);
        }
        tracing::debug!(
            model = chat_model,
            "no tiktoken encoding for model; using heuristic counter"
        );
    }
    Arc::new(HeuristicTokenCounter)
}
