//! End-to-end pipeline tests with deterministic fake providers.
//!
//! Every external boundary (embeddings, chat completion) is scripted, so
//! these tests pin down the observable contract of the engine: citations,
//! budget behavior, cache correctness, and failure atomicity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use rowsmith::chunking::{ChunkingPolicy, ChunkGrouping};
use rowsmith::completion::{CompletionProvider, SynthesisError};
use rowsmith::embeddings::{EmbeddingProvider, EmbeddingServiceError};
use rowsmith::{EngineConfig, HeuristicTokenCounter, RagEngine, RagError, Row, RowFilter};

/// Embedder with a fixed text → vector table.
///
/// Unknown texts embed to the zero vector (similarity 0 to everything);
/// texts containing the poison marker fail the whole batch, which is how the
/// atomicity tests stage a mid-load boundary failure.
#[derive(Default)]
struct ScriptedEmbedder {
    table: HashMap<String, Vec<f32>>,
    poison: Option<String>,
    batch_calls: AtomicUsize,
    texts_embedded: AtomicUsize,
}

impl ScriptedEmbedder {
    fn new() -> Self {
        Self::default()
    }

    fn with_text(mut self, text: &str, vector: [f32; 3]) -> Self {
        self.table.insert(text.to_string(), vector.to_vec());
        self
    }

    fn with_poison(mut self, marker: &str) -> Self {
        self.poison = Some(marker.to_string());
        self
    }

    fn fruit_table() -> Self {
        Self::new()
            .with_text("id: 1; note: apple", [1.0, 0.0, 0.0])
            .with_text("id: 2; note: banana", [0.0, 1.0, 0.0])
            .with_text("id: 3; note: cherry", [0.0, 0.0, 1.0])
            .with_text("fruit starting with b", [0.1, 0.9, 0.1])
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    fn model_name(&self) -> &str {
        "scripted-embedder"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        if let Some(marker) = &self.poison {
            if texts.iter().any(|text| text.contains(marker)) {
                return Err(EmbeddingServiceError::Rejected {
                    status: 400,
                    body: "poisoned input".to_string(),
                });
            }
        }
        Ok(texts
            .iter()
            .map(|text| self.table.get(text).cloned().unwrap_or_else(|| vec![0.0; 3]))
            .collect())
    }
}

/// Completion fake that records every prompt it receives.
struct RecordingCompleter {
    answer: String,
    prompts: Mutex<Vec<String>>,
}

impl RecordingCompleter {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for RecordingCompleter {
    fn model_name(&self) -> &str {
        "recording-chat"
    }

    async fn complete(&self, prompt: &str) -> Result<String, SynthesisError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answer.clone())
    }
}

struct FailingCompleter;

#[async_trait]
impl CompletionProvider for FailingCompleter {
    fn model_name(&self) -> &str {
        "failing-chat"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, SynthesisError> {
        Err(SynthesisError::RetriesExhausted {
            model: "failing-chat".to_string(),
            attempts: 3,
            reason: "service unavailable".to_string(),
        })
    }
}

fn fruit_rows() -> Vec<Row> {
    vec![
        Row::new().with_cell("id", 1_i64).with_cell("note", "apple"),
        Row::new().with_cell("id", 2_i64).with_cell("note", "banana"),
        Row::new().with_cell("id", 3_i64).with_cell("note", "cherry"),
    ]
}

fn keyed_policy() -> ChunkingPolicy {
    ChunkingPolicy {
        key_column: Some("id".into()),
        ..ChunkingPolicy::default()
    }
}

fn engine_with(
    embedder: Arc<ScriptedEmbedder>,
    completer: Arc<RecordingCompleter>,
    token_budget: usize,
) -> RagEngine {
    RagEngine::builder()
        .config(EngineConfig {
            token_budget,
            ..EngineConfig::default()
        })
        .embedding_provider(embedder)
        .completion_provider(completer)
        .token_counter(Arc::new(HeuristicTokenCounter))
        .build()
}

#[tokio::test]
async fn fruit_question_cites_the_banana_row() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("Banana starts with b."));
    let mut engine = engine_with(embedder, completer.clone(), 3072);

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();
    let answer = engine
        .ask_with("fruit starting with b", Some(1), None)
        .await
        .unwrap();

    assert_eq!(answer.cited_rows, vec!["2".to_string()]);
    assert_eq!(answer.answer, "Banana starts with b.");
    assert_eq!(answer.excluded_chunk_count, 0);

    let prompts = completer.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("id: 2; note: banana"));
    assert!(!prompts[0].contains("note: apple"));
}

#[tokio::test]
async fn asking_before_loading_fails_with_empty_index() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("unused"));
    let engine = engine_with(embedder, completer, 3072);

    let err = engine.ask("anything").await.unwrap_err();
    assert!(matches!(err, RagError::EmptyIndex));
}

#[tokio::test]
async fn budget_below_overhead_excludes_every_chunk() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("No rows fit."));
    let mut engine = engine_with(embedder, completer.clone(), 1);

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();
    let answer = engine
        .ask_with("fruit starting with b", Some(3), None)
        .await
        .unwrap();

    assert_eq!(answer.excluded_chunk_count, 3);
    assert!(answer.cited_rows.is_empty());
    assert_eq!(answer.telemetry.context_chunks, 0);

    // The assembler still produced a well-formed prompt with an empty
    // context section.
    let prompts = completer.prompts();
    assert!(prompts[0].contains("CONTEXT:\n\n"));
    assert!(prompts[0].contains("fruit starting with b"));
}

#[tokio::test]
async fn second_load_is_served_entirely_from_cache() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("cached"));
    let mut engine = engine_with(embedder.clone(), completer, 3072);

    let first = engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();
    assert_eq!(first.cache_misses, 3);
    let embedded_after_first = embedder.texts_embedded.load(Ordering::SeqCst);

    let second = engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();
    assert_eq!(second.cache_hits, 3);
    assert_eq!(second.cache_misses, 0);
    assert_eq!(
        embedder.texts_embedded.load(Ordering::SeqCst),
        embedded_after_first,
        "no chunk text may be embedded twice under the same model"
    );
}

#[tokio::test]
async fn citations_round_trip_through_grouped_chunks() {
    let embedder = Arc::new(
        ScriptedEmbedder::new()
            .with_text("id: 1; note: apple\nid: 2; note: banana", [0.0, 1.0, 0.0])
            .with_text("id: 3; note: cherry", [0.0, 0.0, 1.0])
            .with_text("tropical fruit", [0.0, 1.0, 0.0]),
    );
    let completer = Arc::new(RecordingCompleter::new("Both rows considered."));
    let mut engine = engine_with(embedder, completer, 3072);

    let policy = ChunkingPolicy {
        grouping: ChunkGrouping::FixedSize(2),
        key_column: Some("id".into()),
        ..ChunkingPolicy::default()
    };
    engine.load_dataset(fruit_rows(), &policy).await.unwrap();

    let answer = engine
        .ask_with("tropical fruit", Some(1), None)
        .await
        .unwrap();
    assert_eq!(answer.cited_rows, vec!["1".to_string(), "2".to_string()]);
}

#[tokio::test]
async fn row_filter_narrows_citations() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("filtered"));
    let mut engine = engine_with(embedder, completer, 3072);

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();

    let filter = RowFilter::Equals {
        column: "note".into(),
        value: "cherry".into(),
    };
    let answer = engine
        .ask_with("fruit starting with b", Some(3), Some(&filter))
        .await
        .unwrap();
    assert_eq!(answer.cited_rows, vec!["3".to_string()]);
}

#[tokio::test]
async fn repeated_questions_rank_identically() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("same"));
    let mut engine = engine_with(embedder, completer, 3072);

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();

    let first = engine.ask("fruit starting with b").await.unwrap();
    let second = engine.ask("fruit starting with b").await.unwrap();
    assert_eq!(first.cited_rows, second.cited_rows);
    assert_ne!(
        first.telemetry.transaction_id, second.telemetry.transaction_id,
        "each ask is its own transaction"
    );
}

#[tokio::test]
async fn synthesis_failure_discards_the_transaction() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let mut engine = RagEngine::builder()
        .embedding_provider(embedder)
        .completion_provider(Arc::new(FailingCompleter))
        .token_counter(Arc::new(HeuristicTokenCounter))
        .build();

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();

    let err = engine.ask("fruit starting with b").await.unwrap_err();
    assert!(matches!(err, RagError::Synthesis(_)));
}

#[tokio::test]
async fn failed_load_leaves_previous_dataset_and_cache_untouched() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table().with_poison("poison"));
    let completer = Arc::new(RecordingCompleter::new("still the old dataset"));
    let mut engine = engine_with(embedder, completer, 3072);

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();
    let cached_before = engine.cache().len();

    let bad_rows = vec![
        Row::new().with_cell("id", 9_i64).with_cell("note", "poison pill"),
    ];
    let err = engine.load_dataset(bad_rows, &keyed_policy()).await.unwrap_err();
    assert!(matches!(err, RagError::Embedding(_)));
    assert_eq!(engine.cache().len(), cached_before);

    // The previous index is still live and answers as before.
    let answer = engine
        .ask_with("fruit starting with b", Some(1), None)
        .await
        .unwrap();
    assert_eq!(answer.cited_rows, vec!["2".to_string()]);
}

#[tokio::test]
async fn swapping_the_embedding_provider_invalidates_its_cache() {
    let embedder = Arc::new(ScriptedEmbedder::fruit_table());
    let completer = Arc::new(RecordingCompleter::new("rebuilt"));
    let mut engine = engine_with(embedder, completer, 3072);

    engine
        .load_dataset(fruit_rows(), &keyed_policy())
        .await
        .unwrap();
    assert_eq!(engine.cache().len(), 3);

    engine.set_embedding_provider(Arc::new(ScriptedEmbedder::fruit_table()));
    assert_eq!(engine.cache().len(), 0, "old model's records are stale");

    // Until a dataset is loaded again the index is gone.
    let err = engine.ask("fruit starting with b").await.unwrap_err();
    assert!(matches!(err, RagError::EmptyIndex));
}
