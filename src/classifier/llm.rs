//! OpenAI-compatible chat-completions client and the function-calling
//! classifier built on it.

use super::function_schema::{strip_code_fences, ChatMessage, FunctionCall, FunctionDefinition};
use super::{Classification, ClassificationRequest, QueryClassifier};
use crate::config::LlmConfig;
use crate::context::QueryContext;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const CLASSIFIER_PROMPT: &str = "You translate questions about a table of engineering projects into exactly one function call. \
Copy names, statuses and regions exactly as the user wrote them; never invent column names or values. \
Use the previous question and its arguments only when the user refers back to them.";

const SAMPLE_ROWS_IN_PROMPT: usize = 5;

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EngineError::Config("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn with_token_limit(&self, mut body: Value) -> Value {
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = json!(2000);
        } else if self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = json!(500);
        } else {
            body["max_tokens"] = json!(500);
        }
        body
    }

    async fn post(&self, body: Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Classifier(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited(
                "the classification service is saturated, try again shortly".to_string(),
            ));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Classifier(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Classifier(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(EngineError::Classifier(format!("LLM API error: {}", error)));
        }
        Ok(response_json)
    }

    fn first_message(response_json: &Value) -> Result<&Value> {
        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .ok_or_else(|| EngineError::Classifier("No choices array in LLM response".to_string()))?;
        let choice = choices
            .first()
            .ok_or_else(|| EngineError::Classifier("Empty choices array in LLM response".to_string()))?;
        if choice.get("finish_reason").and_then(|r| r.as_str()) == Some("length") {
            warn!("LLM response was truncated due to length limit");
        }
        Ok(&choice["message"])
    }

    /// Plain completion; returns the message text.
    pub async fn call_llm(&self, system: &str, prompt: &str) -> Result<String> {
        let body = self.with_token_limit(json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
        }));
        let response_json = self.post(body).await?;
        let content = Self::first_message(&response_json)?["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(EngineError::Classifier("Empty content in LLM response".to_string()));
        }
        Ok(content)
    }

    /// Completion with function calling. A reply without a function call is
    /// malformed output.
    pub async fn call_llm_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionDefinition],
    ) -> Result<FunctionCall> {
        let api_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                let mut msg = json!({ "role": m.role });
                if let Some(ref content) = m.content {
                    msg["content"] = json!(content);
                }
                if let Some(ref function_call) = m.function_call {
                    msg["function_call"] = json!({
                        "name": function_call.name,
                        "arguments": function_call.arguments,
                    });
                }
                msg
            })
            .collect();

        let body = self.with_token_limit(json!({
            "model": self.model,
            "messages": api_messages,
            "functions": functions,
            "function_call": "auto",
            "temperature": 0.1,
        }));

        let response_json = self.post(body).await?;
        let message = Self::first_message(&response_json)?;

        match message.get("function_call") {
            Some(function_call) => {
                let name = function_call["name"]
                    .as_str()
                    .ok_or_else(|| EngineError::MalformedClassification("No function name in function_call".to_string()))?
                    .to_string();
                let arguments = function_call["arguments"].as_str().unwrap_or("{}").to_string();
                debug!(function = %name, arguments = %arguments, "LLM chose function");
                Ok(FunctionCall { name, arguments })
            }
            None => {
                let content = message.get("content").and_then(|c| c.as_str()).unwrap_or("");
                Err(EngineError::MalformedClassification(format!(
                    "LLM did not call a function. Response: {}",
                    content
                )))
            }
        }
    }
}

/// Parses a function call into an unvalidated classification.
pub fn parse_function_call(function_call: &FunctionCall) -> Result<Classification> {
    let cleaned = strip_code_fences(&function_call.arguments);
    let cleaned = if cleaned.is_empty() { "{}" } else { cleaned };
    let value: Value = serde_json::from_str(cleaned).map_err(|e| {
        EngineError::MalformedClassification(format!(
            "Failed to parse function call arguments: {}. Arguments: {}",
            e, function_call.arguments
        ))
    })?;
    match value {
        Value::Object(raw_arguments) => Ok(Classification {
            template_name: function_call.name.clone(),
            raw_arguments,
        }),
        other => Err(EngineError::MalformedClassification(format!(
            "function arguments are not an object: {}",
            other
        ))),
    }
}

fn describe_context(label: &str, context: &QueryContext) -> String {
    let mut out = format!(
        "{} question: {}\n{} function: {} {}\n",
        label,
        context.question,
        label,
        context.template_name,
        Value::Object(context.arguments.clone())
    );
    if let Some(rows) = &context.result_rows {
        let sample: Vec<&crate::query::plan::Row> = rows.iter().take(SAMPLE_ROWS_IN_PROMPT).collect();
        out.push_str(&format!(
            "{} result ({} rows, first {}): {}\n",
            label,
            rows.len(),
            sample.len(),
            serde_json::to_string(&sample).unwrap_or_default()
        ));
    }
    out
}

/// Renders question and context into the user message.
pub fn render_request(request: &ClassificationRequest) -> String {
    let mut prompt = String::new();
    if let Some(original) = &request.original {
        prompt.push_str(&describe_context("Original", original));
    }
    if let Some(previous) = &request.previous {
        let same_as_original = request
            .original
            .as_ref()
            .map(|o| o.same_turn(previous))
            .unwrap_or(false);
        if !same_as_original {
            prompt.push_str(&describe_context("Previous", previous));
        }
    }
    prompt.push_str(&format!("Question: {}", request.question));
    prompt
}

pub struct LlmClassifier {
    client: LlmClient,
    catalog: std::sync::Arc<super::templates::TemplateCatalog>,
}

impl LlmClassifier {
    pub fn new(client: LlmClient, catalog: std::sync::Arc<super::templates::TemplateCatalog>) -> Self {
        Self { client, catalog }
    }
}

#[async_trait]
impl QueryClassifier for LlmClassifier {
    fn name(&self) -> &str {
        "llm"
    }

    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification> {
        let functions = self.catalog.function_definitions(&request.candidate_templates);
        if functions.is_empty() {
            return Err(EngineError::Classifier("no candidate templates".to_string()));
        }
        let messages = vec![
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(render_request(request)),
        ];
        info!(
            model = %self.client.model(),
            candidates = functions.len(),
            "Classifying question"
        );
        let call = self.client.call_llm_with_functions(&messages, &functions).await?;
        parse_function_call(&call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_parse_fenced_arguments() {
        let call = FunctionCall {
            name: "search_projects".to_string(),
            arguments: "```json\n{\"status\": \"open\"}\n```".to_string(),
        };
        let parsed = parse_function_call(&call).unwrap();
        assert_eq!(parsed.template_name, "search_projects");
        assert_eq!(parsed.raw_arguments["status"], json!("open"));
    }

    #[test]
    fn test_non_object_arguments_are_malformed() {
        let call = FunctionCall {
            name: "search_projects".to_string(),
            arguments: "[1,2]".to_string(),
        };
        assert!(matches!(
            parse_function_call(&call),
            Err(EngineError::MalformedClassification(_))
        ));
    }

    #[test]
    fn test_empty_arguments_are_an_empty_object() {
        let call = FunctionCall {
            name: "count_projects".to_string(),
            arguments: String::new(),
        };
        assert!(parse_function_call(&call).unwrap().raw_arguments.is_empty());
    }

    #[test]
    fn test_render_request_includes_context() {
        let mut arguments = Map::new();
        arguments.insert("status".to_string(), json!("open"));
        let original = QueryContext {
            question: "show open projects".to_string(),
            template_name: "search_projects".to_string(),
            arguments,
            result_rows: Some(vec![]),
            depth: 0,
        };
        let request = ClassificationRequest {
            question: "top 5 of these".to_string(),
            previous: Some(original.clone()),
            original: Some(original),
            candidate_templates: vec![],
        };
        let prompt = render_request(&request);
        assert!(prompt.contains("Original question: show open projects"));
        assert!(!prompt.contains("Previous question"));
        assert!(prompt.ends_with("Question: top 5 of these"));
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let err = LlmClient::from_config(&LlmConfig::default()).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
