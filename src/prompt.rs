//! Prompt assembly: deterministic rendering plus chunk→row provenance.

use serde::{Deserialize, Serialize};

use crate::budget::{BudgetedContext, TokenCounter};
use crate::dataset::RowId;

/// Slot that receives the retrieved context block.
pub const CONTEXT_SLOT: &str = "{context}";
/// Slot that receives the user's question.
pub const QUESTION_SLOT: &str = "{question}";

/// Errors from template validation.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The template body lacks a required named slot.
    #[error("template body is missing required slot '{slot}'")]
    MissingSlot { slot: &'static str },
}

/// Fixed instruction template with `{context}` and `{question}` slots.
///
/// Rendering is byte-deterministic: the same context and question always
/// produce the identical prompt. Slot text inside the *values* is never
/// re-interpreted; only slots present in the template itself are filled.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    system: String,
    body: String,
}

impl PromptTemplate {
    pub fn new(
        system: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let body = body.into();
        for slot in [CONTEXT_SLOT, QUESTION_SLOT] {
            if !body.contains(slot) {
                return Err(TemplateError::MissingSlot { slot });
            }
        }
        Ok(Self {
            system: system.into(),
            body,
        })
    }

    /// Renders the full prompt text.
    pub fn render(&self, context_block: &str, question: &str) -> String {
        let mut rendered = String::with_capacity(
            self.system.len() + self.body.len() + context_block.len() + question.len() + 2,
        );
        rendered.push_str(&self.system);
        rendered.push_str("\n\n");

        // Single pass over the template so slot markers occurring inside the
        // substituted values are left untouched.
        let mut rest = self.body.as_str();
        loop {
            let next_context = rest.find(CONTEXT_SLOT);
            let next_question = rest.find(QUESTION_SLOT);
            let (at, slot, value) = match (next_context, next_question) {
                (None, None) => break,
                (Some(c), None) => (c, CONTEXT_SLOT, context_block),
                (None, Some(q)) => (q, QUESTION_SLOT, question),
                (Some(c), Some(q)) if c < q => (c, CONTEXT_SLOT, context_block),
                (_, Some(q)) => (q, QUESTION_SLOT, question),
            };
            rendered.push_str(&rest[..at]);
            rendered.push_str(value);
            rest = &rest[at + slot.len()..];
        }
        rendered.push_str(rest);
        rendered
    }

    /// Fixed token overhead of this template for `question`: everything in
    /// the rendered prompt except the context chunks themselves.
    pub fn overhead_tokens(&self, question: &str, counter: &dyn TokenCounter) -> usize {
        counter.count_tokens(&self.render("", question))
    }

    /// Renders the prompt for a budgeted context and records which rows back
    /// each included chunk.
    pub fn assemble(&self, context: &BudgetedContext, question: &str) -> AssembledPrompt {
        let context_block = context
            .chunks
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let provenance = context
            .chunks
            .iter()
            .map(|chunk| ChunkProvenance {
                chunk_id: chunk.id.clone(),
                row_ids: chunk.source_rows.clone(),
            })
            .collect();
        AssembledPrompt {
            text: self.render(&context_block, question),
            provenance,
        }
    }
}

impl Default for PromptTemplate {
    /// Grounded-answer template: the model is pinned to the supplied rows.
    fn default() -> Self {
        Self::new(
            "You are an expert advisor over a tabular dataset. \
             Use ONLY the context rows to craft the answer.",
            "CONTEXT:\n{context}\n\nQUESTION:\n{question}\n\n\
             Answer from the context rows above. If the context is empty, \
             say that no matching rows were found.",
        )
        .expect("default template declares both slots")
    }
}

/// Which source rows stand behind one included chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkProvenance {
    pub chunk_id: String,
    pub row_ids: Vec<RowId>,
}

/// A fully rendered prompt plus the provenance needed for citations.
#[derive(Clone, Debug)]
pub struct AssembledPrompt {
    pub text: String,
    pub provenance: Vec<ChunkProvenance>,
}

impl AssembledPrompt {
    /// Row ids behind the prompt, in context rank order, deduplicated.
    pub fn cited_rows(&self) -> Vec<RowId> {
        let mut seen = std::collections::HashSet::new();
        let mut cited = Vec::new();
        for chunk in &self.provenance {
            for row_id in &chunk.row_ids {
                if seen.insert(row_id.clone()) {
                    cited.push(row_id.clone());
                }
            }
        }
        cited
    }
}
