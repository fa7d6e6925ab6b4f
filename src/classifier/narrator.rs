//! Narrative fallback
//!
//! When the classifier output cannot be turned into a query, the engine
//! answers with a short narrative over a few sample rows instead of a table.

use super::llm::LlmClient;
use crate::error::Result;
use crate::query::plan::Row;
use async_trait::async_trait;
use itertools::Itertools;

const NARRATOR_PROMPT: &str = "You answer questions about engineering projects. \
Use only the sample rows provided. Be brief and say when the sample is not enough to answer.";

#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(&self, question: &str, samples: &[Row]) -> Result<String>;
}

pub struct LlmNarrator {
    client: LlmClient,
}

impl LlmNarrator {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Narrator for LlmNarrator {
    async fn narrate(&self, question: &str, samples: &[Row]) -> Result<String> {
        let prompt = format!(
            "Question: {}\nSample rows: {}",
            question,
            serde_json::to_string(samples)?
        );
        self.client.call_llm(NARRATOR_PROMPT, &prompt).await
    }
}

/// Deterministic narrative used when no LLM is configured.
pub struct TemplateNarrator;

#[async_trait]
impl Narrator for TemplateNarrator {
    async fn narrate(&self, question: &str, samples: &[Row]) -> Result<String> {
        if samples.is_empty() {
            return Ok(format!(
                "I could not turn \"{}\" into a query and found no sample projects to show.",
                question.trim()
            ));
        }
        let columns = samples
            .iter()
            .flat_map(|row| row.keys())
            .unique()
            .take(6)
            .join(", ");
        Ok(format!(
            "I could not turn \"{}\" into a precise query. Here are {} sample projects ({}) to help you rephrase.",
            question.trim(),
            samples.len(),
            columns
        ))
    }
}
