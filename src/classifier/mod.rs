//! Query Classifier
//!
//! The classifier maps a question (plus optional follow-up context) to a
//! template name and raw arguments. Its output is untrusted: the catalog
//! validates the shape and every entity argument still goes through the
//! resolver.

pub mod function_schema;
pub mod llm;
pub mod narrator;
pub mod queue;
pub mod templates;

use crate::context::QueryContext;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;

pub use llm::{LlmClassifier, LlmClient};
pub use narrator::{LlmNarrator, Narrator, TemplateNarrator};
pub use queue::ClassificationQueue;
pub use templates::{ArgumentKind, ArgumentSpec, QueryTemplate, TemplateCatalog, TemplateShape};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub question: String,
    pub previous: Option<QueryContext>,
    pub original: Option<QueryContext>,
    /// Template names the classifier may choose from.
    pub candidate_templates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub template_name: String,
    pub raw_arguments: Map<String, Value>,
}

impl Classification {
    pub fn new(template_name: impl Into<String>, raw_arguments: Value) -> Self {
        Self {
            template_name: template_name.into(),
            raw_arguments: match raw_arguments {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

#[async_trait]
pub trait QueryClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification>;
}

/// Optional shortlisting of templates before classification.
#[async_trait]
pub trait TemplateRetriever: Send + Sync {
    async fn shortlist(&self, question: &str, templates: &[QueryTemplate]) -> Result<Vec<String>>;
}

/// Replays canned classifications in order. Used by fixtures and tests.
#[derive(Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<Classification>>>,
    seen: Mutex<Vec<ClassificationRequest>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, classification: Classification) -> Self {
        self.push(Ok(classification));
        self
    }

    pub fn then_err(self, error: EngineError) -> Self {
        self.push(Err(error));
        self
    }

    pub fn push(&self, entry: Result<Classification>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(entry);
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ClassificationRequest> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }
}

#[async_trait]
impl QueryClassifier for ScriptedClassifier {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        next.unwrap_or_else(|| Err(EngineError::Classifier("script exhausted".to_string())))
    }
}

/// Stands in when no LLM is configured; every classification fails.
pub struct DisabledClassifier;

#[async_trait]
impl QueryClassifier for DisabledClassifier {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn classify(&self, _request: &ClassificationRequest) -> Result<Classification> {
        Err(EngineError::Config(
            "no classifier configured, set OPENAI_API_KEY".to_string(),
        ))
    }
}
