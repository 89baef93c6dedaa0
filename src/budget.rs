//! Exact token accounting and budget-bounded context selection.
//!
//! The budget invariant is the one guarantee the rest of the pipeline leans
//! on: for every produced [`BudgetedContext`],
//! `sum(chunk token counts) + overhead <= budget`. A violation is a defect in
//! this module, never a runtime error, so it is enforced with a debug
//! assertion rather than surfaced to callers.

use crate::chunking::Chunk;

/// Counts tokens the way the configured model family does.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Rough fallback counter at ~4 characters per token.
///
/// Only used when the configured chat model is unknown to the exact
/// tokenizer; the estimate rounds up so the budget stays conservative.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// Exact counter backed by `tiktoken-rs`.
#[cfg(feature = "tiktoken")]
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenCounter {
    /// Resolves the tokenizer for `model`, or `None` when tiktoken has no
    /// encoding registered for it.
    pub fn for_model(model: &str) -> Option<Self> {
        tiktoken_rs::get_bpe_from_model(model)
            .ok()
            .map(|bpe| Self { bpe })
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// The chunks selected for one query, in rank order, under the budget.
#[derive(Clone, Debug)]
pub struct BudgetedContext {
    pub chunks: Vec<Chunk>,
    /// Candidates dropped because they did not fit the remaining budget.
    pub excluded_chunks: usize,
    /// Token total of the included chunk texts.
    pub context_tokens: usize,
    /// Fixed template + query overhead the selection was charged against.
    pub overhead_tokens: usize,
}

impl BudgetedContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Greedy rank-order selection against `budget - overhead`.
pub struct TokenBudgeter<'c> {
    counter: &'c dyn TokenCounter,
    budget: usize,
}

impl std::fmt::Debug for TokenBudgeter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgeter")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl<'c> TokenBudgeter<'c> {
    pub fn new(counter: &'c dyn TokenCounter, budget: usize) -> Self {
        Self { counter, budget }
    }

    /// Selects as many ranked chunks as fit.
    ///
    /// Chunks are considered in rank order; one that alone exceeds the
    /// remaining budget is skipped whole (chunk boundaries are never split)
    /// and later, smaller chunks may still be admitted. A chunk whose count
    /// exactly equals the remaining budget is included. When the overhead
    /// alone exceeds the budget, every candidate is excluded.
    pub fn select(&self, ranked: Vec<Chunk>, overhead: usize) -> BudgetedContext {
        if overhead > self.budget {
            tracing::warn!(
                overhead,
                budget = self.budget,
                "prompt overhead exceeds token budget; context will be empty"
            );
            return BudgetedContext {
                excluded_chunks: ranked.len(),
                chunks: Vec::new(),
                context_tokens: 0,
                overhead_tokens: overhead,
            };
        }

        let remaining = self.budget - overhead;
        let mut used = 0usize;
        let mut chunks = Vec::new();
        let mut excluded = 0usize;

        for chunk in ranked {
            let cost = chunk.token_count(self.counter);
            if used + cost > remaining {
                excluded += 1;
                continue;
            }
            used += cost;
            chunks.push(chunk);
        }

        debug_assert!(used + overhead <= self.budget, "token budget overrun");

        BudgetedContext {
            chunks,
            excluded_chunks: excluded,
            context_tokens: used,
            overhead_tokens: overhead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts one token per character, which makes budgets easy to stage.
    struct CharCounter;

    impl TokenCounter for CharCounter {
        fn count_tokens(&self, text: &str) -> usize {
            text.len()
        }
    }

    fn chunk_of(text: &str) -> Chunk {
        let rows = vec![crate::dataset::Row::new().with_cell("note", text)];
        let outcome =
            crate::chunking::chunk_rows(&rows, &crate::chunking::ChunkingPolicy::default())
                .unwrap();
        outcome.chunks.into_iter().next().unwrap()
    }

    #[test]
    fn exact_fit_is_included() {
        let counter = CharCounter;
        let chunk = chunk_of("abcde"); // renders "note: abcde" = 11 chars
        let budgeter = TokenBudgeter::new(&counter, 16);
        let context = budgeter.select(vec![chunk], 5);
        assert_eq!(context.chunks.len(), 1);
        assert_eq!(context.context_tokens, 11);
        assert_eq!(context.excluded_chunks, 0);
    }

    #[test]
    fn one_over_budget_is_excluded() {
        let counter = CharCounter;
        let chunk = chunk_of("abcde");
        let budgeter = TokenBudgeter::new(&counter, 15);
        let context = budgeter.select(vec![chunk], 5);
        assert!(context.is_empty());
        assert_eq!(context.excluded_chunks, 1);
    }

    #[test]
    fn oversized_chunk_is_skipped_not_truncated() {
        let counter = CharCounter;
        let big = chunk_of("a very long note that cannot fit");
        let small = chunk_of("ok"); // "note: ok" = 8 chars
        let budgeter = TokenBudgeter::new(&counter, 10);
        let context = budgeter.select(vec![big, small], 0);
        assert_eq!(context.chunks.len(), 1);
        assert_eq!(context.chunks[0].text, "note: ok");
        assert_eq!(context.excluded_chunks, 1);
        assert_eq!(context.context_tokens, 8);
    }

    #[test]
    fn overhead_above_budget_excludes_everything() {
        let counter = CharCounter;
        let empty = chunk_of(""); // empty rendering costs zero tokens
        let budgeter = TokenBudgeter::new(&counter, 10);
        let context = budgeter.select(vec![empty, chunk_of("x")], 11);
        assert!(context.is_empty());
        assert_eq!(context.excluded_chunks, 2);
        assert_eq!(context.context_tokens, 0);
    }

    #[test]
    fn rank_order_is_preserved() {
        let counter = CharCounter;
        let first = chunk_of("aa");
        let second = chunk_of("bb");
        let budgeter = TokenBudgeter::new(&counter, 64);
        let context = budgeter.select(vec![first.clone(), second.clone()], 0);
        assert_eq!(context.chunks[0].id, first.id);
        assert_eq!(context.chunks[1].id, second.id);
    }

    #[test]
    fn heuristic_counter_rounds_up() {
        let counter = HeuristicTokenCounter;
        assert_eq!(counter.count_tokens(""), 0);
        assert_eq!(counter.count_tokens("abc"), 1);
        assert_eq!(counter.count_tokens("abcde"), 2);
    }
}
