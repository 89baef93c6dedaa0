//! End-to-end demo: ask questions against a small franchise spreadsheet.
//!
//! Runs fully offline by default (deterministic mock embeddings plus a local
//! demo completer). Set `OPENAI_API_KEY` to route both boundaries through the
//! real OpenAI-compatible clients instead:
//!
//! ```bash
//! cargo run --example franchise_advisor
//! OPENAI_API_KEY=sk-... cargo run --example franchise_advisor
//! ```

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tracing_subscriber::FmtSubscriber;

use rowsmith::chunking::ChunkingPolicy;
use rowsmith::completion::{CompletionProvider, SynthesisError};
use rowsmith::{
    EngineConfig, MockEmbeddingProvider, RagEngine, RagError, RemoteCompletionClient,
    RemoteEmbeddingClient, Row, RowFilter,
};

#[tokio::main]
async fn main() -> Result<(), RagError> {
    init_tracing();

    let config = EngineConfig::default();
    let mut builder = RagEngine::builder().config(config.clone());

    builder = match env::var("OPENAI_API_KEY") {
        Ok(api_key) => {
            println!("Using remote OpenAI-compatible providers");
            let embedder = RemoteEmbeddingClient::builder()
                .api_key(api_key.clone())
                .model(config.embedding_model.clone())
                .dimensions(1536)
                .build()?;
            let completer = RemoteCompletionClient::builder()
                .api_key(api_key)
                .model(config.chat_model.clone())
                .build()?;
            builder
                .embedding_provider(Arc::new(embedder))
                .completion_provider(Arc::new(completer))
        }
        Err(_) => {
            println!("No OPENAI_API_KEY set; using offline demo providers");
            builder
                .embedding_provider(Arc::new(MockEmbeddingProvider::new()))
                .completion_provider(Arc::new(DemoCompleter))
        }
    };

    let mut engine = builder.build();

    let policy = ChunkingPolicy {
        key_column: Some("franchise name".into()),
        ..ChunkingPolicy::default()
    };
    let load = engine.load_dataset(franchise_rows(), &policy).await?;
    println!(
        "Indexed {} chunks ({} cache hits, {} misses) in {} ms\n",
        load.chunk_count, load.cache_hits, load.cache_misses, load.duration_ms
    );

    let question = "Which pet franchise could I run part-time on a modest budget?";
    let filter = RowFilter::All(vec![
        RowFilter::ContainsAny {
            column: "industry".into(),
            keywords: vec!["pets".into()],
        },
        RowFilter::AtMost {
            column: "cash required".into(),
            limit: 150_000.0,
        },
    ]);

    let answer = engine.ask_with(question, None, Some(&filter)).await?;

    println!("Q: {question}");
    println!("A: {}", answer.answer);
    println!("derived from rows: {}", answer.cited_rows.join(", "));
    println!(
        "({} context chunks, {} excluded for budget, {} prompt tokens)",
        answer.telemetry.context_chunks, answer.excluded_chunk_count, answer.telemetry.prompt_tokens
    );

    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let subscriber = FmtSubscriber::builder().with_env_filter("info").finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn franchise_rows() -> Vec<Row> {
    vec![
        Row::new()
            .with_cell("franchise name", "Pet Palace")
            .with_cell("industry", "Pets")
            .with_cell("cash required", "95,000")
            .with_cell("number of units open", 42_i64)
            .with_cell("semi-absentee ownership", "Yes"),
        Row::new()
            .with_cell("franchise name", "Grind Coffee Co")
            .with_cell("industry", "Coffee")
            .with_cell("cash required", "180,000")
            .with_cell("number of units open", 230_i64)
            .with_cell("semi-absentee ownership", "No"),
        Row::new()
            .with_cell("franchise name", "Happy Hounds Grooming")
            .with_cell("industry", "Pets & Grooming")
            .with_cell("cash required", "120,000")
            .with_cell("number of units open", 15_i64)
            .with_cell("semi-absentee ownership", "Yes"),
        Row::new()
            .with_cell("franchise name", "FlexFit Studios")
            .with_cell("industry", "Fitness")
            .with_cell("cash required", "250,000")
            .with_cell("number of units open", 310_i64)
            .with_cell("semi-absentee ownership", "No"),
    ]
}

/// Offline stand-in for the chat boundary: repeats what it was grounded on.
struct DemoCompleter;

#[async_trait]
impl CompletionProvider for DemoCompleter {
    fn model_name(&self) -> &str {
        "demo-completer"
    }

    async fn complete(&self, prompt: &str) -> Result<String, SynthesisError> {
        let context_lines = prompt
            .lines()
            .filter(|line| line.contains("franchise name:"))
            .count();
        Ok(format!(
            "(demo) I looked at {context_lines} candidate rows from the dataset; \
             with a real chat model configured this would be a grounded recommendation."
        ))
    }
}
