//! Boundary guards
//!
//! Deterministic checks that run before any classifier or data source call:
//! length limits, write/DDL keywords and a lexical off-topic filter.

use crate::error::{EngineError, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DANGEROUS: Regex = Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|grant|revoke|exec|execute|truncate|create|merge)\b"
    )
    .unwrap();
    static ref DATASET_VOCABULARY: Regex = Regex::new(
        r"(?i)\b(projects?|clients?|compan(y|ies)|fees?|revenue|status(es)?|regions?|division|department|city|cities|state|proposals?|bids?|contracts?|awarded|won|lost|pending|open|active|closed|highway|bridge|transit|rail|count|how many|total|top|list|show|biggest|largest)\b"
    )
    .unwrap();
    static ref OFF_TOPIC: Regex = Regex::new(
        r"(?i)\b(weather|forecast|jokes?|recipes?|cook(ing)?|movies?|songs?|lyrics|poems?|horoscope|sports? scores?|football|basketball|translate|who are you|tell me about yourself|celebrity|dating)\b"
    )
    .unwrap();
}

/// Write or DDL keyword found in the question, if any.
pub fn dangerous_keyword(question: &str) -> Option<String> {
    DANGEROUS
        .find(question)
        .map(|m| m.as_str().to_uppercase())
}

/// No dataset vocabulary and a known off-topic pattern.
pub fn is_off_topic(question: &str) -> bool {
    !DATASET_VOCABULARY.is_match(question) && OFF_TOPIC.is_match(question)
}

/// Runs every guard in order: length, restricted keywords, off-topic.
pub fn check_question(question: &str, max_length: usize) -> Result<()> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidRequest("question is empty".to_string()));
    }
    if trimmed.chars().count() > max_length {
        return Err(EngineError::InvalidRequest(format!(
            "question is longer than {} characters",
            max_length
        )));
    }
    if let Some(keyword) = dangerous_keyword(trimmed) {
        return Err(EngineError::RestrictedOperation(format!(
            "'{}' operations are not allowed; only read-only questions are supported",
            keyword
        )));
    }
    if is_off_topic(trimmed) {
        return Err(EngineError::OffTopic(
            "I can only answer questions about the projects dataset".to_string(),
        ));
    }
    Ok(())
}
