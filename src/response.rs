//! Response Composer
//!
//! Every request ends in exactly one `QueryResponse` variant. The server and
//! CLI render it with `to_api_json`, which produces the boundary shapes.

use crate::context::ContextChain;
use crate::disambiguation::{display_name, Disambiguation};
use crate::error::{EngineError, ErrorKind};
use crate::index::SimilarValue;
use crate::query::plan::{ParameterizedQuery, Projection, QueryPlan, Row, COUNT_ALIAS, TOTAL_ALIAS};
use itertools::{Itertools, MinMaxResult};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericStats {
    pub total: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<NumericStats>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub status_breakdown: BTreeMap<String, usize>,
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

impl Summary {
    pub fn from_rows(rows: &[Row], fee_column: &str, status_column: &str) -> Option<Self> {
        if rows.is_empty() {
            return None;
        }
        let fees: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(fee_column).and_then(as_number))
            .collect();
        let fee = match fees.iter().copied().minmax_by(|a, b| a.total_cmp(b)) {
            MinMaxResult::NoElements => None,
            MinMaxResult::OneElement(v) => Some((v, v)),
            MinMaxResult::MinMax(min, max) => Some((min, max)),
        }
        .map(|(min, max)| {
            let total: f64 = fees.iter().sum();
            NumericStats {
                total,
                average: total / fees.len() as f64,
                min,
                max,
            }
        });
        let status_breakdown: BTreeMap<String, usize> = rows
            .iter()
            .filter_map(|row| row.get(status_column).and_then(|v| v.as_str()))
            .map(str::to_string)
            .counts()
            .into_iter()
            .collect();
        Some(Self {
            row_count: rows.len(),
            fee,
            status_breakdown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartConfig {
    pub chart_type: String,
    pub x_axis: String,
    pub y_axis: String,
    pub title: String,
}

/// Bar chart hint for grouped results.
pub fn chart_for(plan: &QueryPlan) -> Option<ChartConfig> {
    let (column, measure, title) = match &plan.projection {
        Projection::GroupCount { column } => (column, COUNT_ALIAS, format!("Projects by {}", display_name(column))),
        Projection::GroupSum { column, .. } => (column, TOTAL_ALIAS, format!("Total fee by {}", display_name(column))),
        _ => return None,
    };
    Some(ChartConfig {
        chart_type: "bar".to_string(),
        x_axis: column.clone(),
        y_axis: measure.to_string(),
        title,
    })
}

#[derive(Debug, Clone)]
pub struct TabularResult {
    pub rows: Vec<Row>,
    pub summary: Option<Summary>,
    pub query: ParameterizedQuery,
    pub template: String,
    pub arguments: Map<String, Value>,
    pub chart: Option<ChartConfig>,
}

#[derive(Debug, Clone)]
pub enum QueryResponse {
    Tabular(TabularResult),
    Disambiguation(Disambiguation),
    Suggestions { reason: String, alternatives: Vec<String> },
    NarrativeFallback { text: String, samples: Vec<Row> },
    Error { kind: ErrorKind, message: String },
}

impl QueryResponse {
    pub fn from_error(error: &EngineError) -> Self {
        let kind = error.kind();
        let message = match kind {
            // internals stay in the logs
            ErrorKind::InternalError => "the request could not be completed".to_string(),
            _ => error.to_string(),
        };
        QueryResponse::Error { kind, message }
    }

    pub fn variant(&self) -> &'static str {
        match self {
            QueryResponse::Tabular(_) => "tabular",
            QueryResponse::Disambiguation(_) => "disambiguation",
            QueryResponse::Suggestions { .. } => "suggestions",
            QueryResponse::NarrativeFallback { .. } => "narrative_fallback",
            QueryResponse::Error { .. } => "error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            QueryResponse::Error { kind, .. } => kind.status_code(),
            _ => 200,
        }
    }

    /// Boundary JSON. `next_context` is attached to tabular answers.
    pub fn to_api_json(&self, next_context: Option<&ContextChain>) -> Value {
        match self {
            QueryResponse::Tabular(result) => {
                let mut body = json!({
                    "success": true,
                    "function_name": result.template,
                    "arguments": result.arguments,
                    "data": result.rows,
                    "sql_query": result.query.sql,
                    "sql_params": result.query.params_json(),
                });
                if let Some(summary) = &result.summary {
                    body["summary"] = json!(summary);
                }
                if let Some(chart) = &result.chart {
                    body["chart_config"] = json!(chart);
                }
                if let Some(chain) = next_context {
                    body["context"] = json!({
                        "previousContext": chain.previous,
                        "originalContext": chain.original,
                    });
                }
                body
            }
            QueryResponse::Disambiguation(choice) => json!({
                "success": true,
                "data": [{
                    "type": "disambiguation",
                    "term": choice.term,
                    "options": choice.options,
                }],
            }),
            QueryResponse::Suggestions { reason, alternatives } => json!({
                "success": true,
                "data": [{
                    "type": "suggested_queries",
                    "reason": reason,
                    "suggestions": alternatives,
                }],
            }),
            QueryResponse::NarrativeFallback { text, samples } => {
                let mut item = json!({ "type": "ai_analysis", "narrative": text });
                if !samples.is_empty() {
                    item["samples"] = json!(samples);
                }
                let mut body = json!({ "success": true, "data": [item] });
                if let Some(chain) = next_context {
                    body["context"] = json!({
                        "previousContext": chain.previous,
                        "originalContext": chain.original,
                    });
                }
                body
            }
            QueryResponse::Error { kind, message } => json!({
                "success": false,
                "error": kind.as_str(),
                "message": message,
            }),
        }
    }
}

/// Alternatives for a term the resolver could not place.
pub fn suggestions_for_unmatched(term: &str, similar: &[SimilarValue]) -> Vec<String> {
    let mut out: Vec<String> = similar
        .iter()
        .map(|s| format!("Show projects where {} is {}", display_name(&s.column), s.value))
        .collect();
    if out.is_empty() {
        out.push(format!("Show projects with \"{}\" in the project name", term.trim()));
    }
    out.push("Show all open projects".to_string());
    out.push("Show the top 10 clients by total fee".to_string());
    out.into_iter().unique().collect()
}

/// Alternatives for a query that matched nothing: drop one filter at a time.
pub fn suggestions_for_empty(arguments: &Map<String, Value>) -> Vec<String> {
    let mentions: Vec<(&String, &str)> = arguments
        .iter()
        .filter(|(key, _)| matches!(key.as_str(), "entity" | "status" | "region" | "project_type"))
        .filter_map(|(key, value)| value.as_str().map(|v| (key, v)))
        .collect();
    let mut out = Vec::new();
    if mentions.len() > 1 {
        for (dropped, _) in &mentions {
            let kept = mentions
                .iter()
                .filter(|(key, _)| key != dropped)
                .map(|(_, v)| *v)
                .join(", ");
            out.push(format!("Show projects for {}", kept));
        }
    } else if let Some((_, value)) = mentions.first() {
        out.push(format!("Show all projects for {}", value));
    }
    if arguments.keys().any(|k| k.contains("fee") || k.starts_with("start_")) {
        out.push("Try a wider fee or date range".to_string());
    }
    out.push("Show all open projects".to_string());
    out.into_iter().unique().collect()
}
