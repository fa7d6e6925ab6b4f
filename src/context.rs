//! Context Chainer
//!
//! A chain is two immutable snapshots: `original` (the root turn, fixed once
//! it resolves) and `previous` (the most recent answered turn). Each request
//! receives the chain from the caller and, on success, hands back a new one.
//! Nothing is stored between requests.

use crate::classifier::QueryTemplate;
use crate::config::ColumnConfig;
use crate::disambiguation::{parse_markers, FilterMarker};
use crate::error::{EngineError, Result};
use crate::query::plan::{Filter, Row};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

lazy_static! {
    static ref ANAPHORA: Regex = Regex::new(
        r"(?i)\b(these|those|them|of this|in this|this list|that list|the above|from above|above results?|previous results?|the results|the same|same ones|narrow (it|them|down)|filter (it|them)|of which|among them)\b"
    )
    .unwrap();
    static ref SAME_NOUN: Regex = Regex::new(r"(?i)\bthe same ([a-z]+(?: [a-z]+)?)").unwrap();
}

/// One answered turn as seen by later follow-ups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    pub question: String,
    pub template_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Tabular rows only, capped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_rows: Option<Vec<Row>>,
    /// Answered follow-ups since the root.
    #[serde(default)]
    pub depth: u32,
}

impl QueryContext {
    /// Same question, template and arguments, ignoring depth and rows.
    pub fn same_turn(&self, other: &QueryContext) -> bool {
        self.question == other.question
            && self.template_name == other.template_name
            && self.arguments == other.arguments
    }

    fn with_depth(&self, depth: u32) -> Self {
        Self {
            depth,
            ..self.clone()
        }
    }
}

pub fn is_anaphoric(question: &str) -> bool {
    ANAPHORA.is_match(question)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Root,
    Following(u32),
    Exhausted,
}

/// How a past turn ended, for rebuilding a chain from history.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Answered(QueryContext),
    Narrative,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextChain {
    pub previous: Option<QueryContext>,
    pub original: Option<QueryContext>,
}

impl ContextChain {
    pub fn new(previous: Option<QueryContext>, original: Option<QueryContext>) -> Self {
        Self { previous, original }
    }

    pub fn state(&self, limit: u32) -> ChainState {
        match &self.previous {
            None => ChainState::Root,
            Some(previous) if previous.depth >= limit => ChainState::Exhausted,
            Some(previous) => ChainState::Following(previous.depth),
        }
    }

    /// Replays assistant turns in order. Failed turns are skipped; a narrative
    /// turn points `previous` back at `original` one level deeper.
    pub fn from_history(turns: &[TurnOutcome]) -> Self {
        let mut chain = ContextChain::default();
        for turn in turns {
            match turn {
                TurnOutcome::Answered(context) => {
                    if context.depth == 0 {
                        chain.original = Some(context.clone());
                    }
                    chain.previous = Some(context.clone());
                }
                TurnOutcome::Narrative => {
                    let depth = chain.previous.as_ref().map(|p| p.depth + 1).unwrap_or(0);
                    chain.previous = chain.original.as_ref().map(|o| o.with_depth(depth));
                }
                TurnOutcome::Failed => {}
            }
        }
        chain
    }

    /// Decides whether `question` follows up on this chain. Rejects a
    /// follow-up past `limit` before anything else runs.
    pub fn begin_turn(&self, question: &str, follow_up: bool, limit: u32) -> Result<TurnContext> {
        let incoming = self.clone();
        let previous = match &self.previous {
            Some(previous) if follow_up || is_anaphoric(question) => previous.clone(),
            _ => {
                return Ok(TurnContext {
                    previous: None,
                    original: None,
                    depth: 0,
                    incoming,
                })
            }
        };

        let depth = previous.depth + 1;
        if depth > limit {
            return Err(EngineError::InvalidRequest(format!(
                "follow-up limit of {} reached, please start a new question",
                limit
            )));
        }
        let original = self.original.clone().unwrap_or_else(|| previous.with_depth(0));
        debug!(depth, "Follow-up attached to context");
        Ok(TurnContext {
            previous: Some(previous),
            original: Some(original),
            depth,
            incoming,
        })
    }
}

/// Context for the turn being answered.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub previous: Option<QueryContext>,
    pub original: Option<QueryContext>,
    /// 0 for a root turn.
    pub depth: u32,
    incoming: ContextChain,
}

impl TurnContext {
    pub fn is_follow_up(&self) -> bool {
        self.previous.is_some()
    }

    /// Current arguments over previous over original, limited to what the
    /// chosen template accepts.
    pub fn merge_arguments(&self, template: &QueryTemplate, current: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = Map::new();
        let layers = [
            self.original.as_ref().map(|c| &c.arguments),
            self.previous.as_ref().map(|c| &c.arguments),
            Some(current),
        ];
        for layer in layers.into_iter().flatten() {
            for (key, value) in layer {
                if template.accepts(key) && !value.is_null() {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    /// Column choices made earlier in the chain.
    pub fn carried_markers(&self) -> Vec<FilterMarker> {
        let mut markers = Vec::new();
        for context in [&self.original, &self.previous].into_iter().flatten() {
            let (_, found) = parse_markers(&context.question);
            for marker in found {
                markers.retain(|m: &FilterMarker| !m.term.eq_ignore_ascii_case(&marker.term));
                markers.push(marker);
            }
        }
        markers
    }

    /// `IN` filters for "the same <noun>" over the previous rows.
    pub fn same_noun_filters(&self, question: &str, columns: &ColumnConfig) -> Vec<Filter> {
        let Some(rows) = self.previous.as_ref().and_then(|p| p.result_rows.as_ref()) else {
            return Vec::new();
        };
        let mut filters = Vec::new();
        for caps in SAME_NOUN.captures_iter(question) {
            let phrase = caps[1].to_lowercase();
            let first_word = phrase.split(' ').next().unwrap_or_default().to_string();
            let column = [phrase.as_str(), first_word.as_str()]
                .iter()
                .find_map(|candidate| columns.canonical(&singular(candidate)));
            let Some(column) = column else {
                debug!("No column for 'the same {}'", phrase);
                continue;
            };
            let values: BTreeSet<String> = rows
                .iter()
                .filter_map(|row| row.get(&column))
                .filter_map(|v| v.as_str())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                debug!("Previous rows carry no values for {}", column);
                continue;
            }
            if filters.iter().any(|f: &Filter| f.column() == column) {
                continue;
            }
            filters.push(Filter::In {
                column,
                values: values.into_iter().collect(),
            });
        }
        filters
    }

    /// The chain after this turn answered with a table.
    pub fn commit(
        &self,
        question: &str,
        template_name: &str,
        arguments: Map<String, Value>,
        rows: &[Row],
        row_limit: usize,
    ) -> ContextChain {
        let context = QueryContext {
            question: question.to_string(),
            template_name: template_name.to_string(),
            arguments,
            result_rows: Some(rows.iter().take(row_limit).cloned().collect()),
            depth: self.depth,
        };
        match &self.original {
            Some(original) if self.is_follow_up() => ContextChain {
                previous: Some(context),
                original: Some(original.clone()),
            },
            _ => ContextChain {
                previous: Some(context.clone()),
                original: Some(context),
            },
        }
    }

    /// The chain after a narrative answer: `previous` falls back to
    /// `original` but carries this turn's depth, so the turn still counts
    /// against the follow-up limit.
    pub fn commit_narrative(&self) -> Option<ContextChain> {
        let original = self.original.clone().or_else(|| self.incoming.original.clone())?;
        Some(ContextChain {
            previous: Some(original.with_depth(self.depth)),
            original: Some(original),
        })
    }
}

fn singular(noun: &str) -> String {
    if let Some(stem) = noun.strip_suffix("ies") {
        format!("{}y", stem)
    } else if noun.ends_with("ses") || noun.ends_with("xes") {
        noun[..noun.len() - 2].to_string()
    } else if let Some(stem) = noun.strip_suffix('s') {
        stem.to_string()
    } else {
        noun.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::templates::{TemplateCatalog, SEARCH_PROJECTS, TOP_BY_FEE};
    use crate::config::EngineConfig;
    use serde_json::json;

    fn context(question: &str, args: Value, depth: u32) -> QueryContext {
        QueryContext {
            question: question.to_string(),
            template_name: SEARCH_PROJECTS.to_string(),
            arguments: args.as_object().cloned().unwrap_or_default(),
            result_rows: Some(
                serde_json::from_value(json!([
                    {"Client": "NYSDOT", "Status": "Active"},
                    {"Client": "MTA", "Status": "Active"},
                    {"Client": "NYSDOT", "Status": "Pending"}
                ]))
                .unwrap(),
            ),
            depth,
        }
    }

    fn root_chain() -> ContextChain {
        let root = context("show open projects in the UAE", json!({"status": "open", "region": "UAE"}), 0);
        ContextChain::new(Some(root.clone()), Some(root))
    }

    #[test]
    fn test_anaphora_detection() {
        assert!(is_anaphoric("top 5 of these"));
        assert!(is_anaphoric("which of those are in Ohio"));
        assert!(is_anaphoric("projects for the same clients"));
        assert!(!is_anaphoric("show open projects"));
    }

    #[test]
    fn test_unrelated_question_starts_new_root() {
        let turn = root_chain().begin_turn("count all projects", false, 3).unwrap();
        assert!(!turn.is_follow_up());
        assert_eq!(turn.depth, 0);
    }

    #[test]
    fn test_fourth_follow_up_rejected() {
        let mut chain = root_chain();
        for expected in 1..=3 {
            let turn = chain.begin_turn("top 5 of these", false, 3).unwrap();
            assert_eq!(turn.depth, expected);
            chain = turn.commit("top 5 of these", SEARCH_PROJECTS, Map::new(), &[], 20);
        }
        assert_eq!(chain.state(3), ChainState::Exhausted);
        let err = chain.begin_turn("top 5 of these", false, 3).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn test_original_is_never_replaced_by_follow_up() {
        let chain = root_chain();
        let turn = chain.begin_turn("only those over 1M", false, 3).unwrap();
        let next = turn.commit("only those over 1M", SEARCH_PROJECTS, Map::new(), &[], 20);
        assert_eq!(next.original, chain.original);
        assert_eq!(next.previous.unwrap().depth, 1);
    }

    #[test]
    fn test_argument_precedence() {
        let config = EngineConfig::default();
        let catalog = TemplateCatalog::standard(&config);
        let original = context("q0", json!({"status": "open", "region": "UAE", "limit": 100}), 0);
        let previous = context("q1", json!({"status": "won", "sort_by": "Fee"}), 1);
        let chain = ContextChain::new(Some(previous), Some(original));
        let turn = chain.begin_turn("top 5 of these", false, 3).unwrap();

        let template = catalog.get(TOP_BY_FEE).unwrap();
        let current = json!({"limit": 5}).as_object().cloned().unwrap();
        let merged = turn.merge_arguments(template, &current);
        assert_eq!(merged["limit"], json!(5));
        assert_eq!(merged["status"], json!("won"));
        assert_eq!(merged["region"], json!("UAE"));
        // top_by_fee has no sort_by
        assert!(!merged.contains_key("sort_by"));
    }

    #[test]
    fn test_same_noun_builds_in_filter() {
        let turn = root_chain().begin_turn("closed projects for the same clients", false, 3).unwrap();
        let filters = turn.same_noun_filters("closed projects for the same clients", &EngineConfig::default().columns);
        assert_eq!(
            filters,
            vec![Filter::In {
                column: "Client".into(),
                values: vec!["MTA".into(), "NYSDOT".into()],
            }]
        );
    }

    #[test]
    fn test_narrative_turn_points_previous_at_original() {
        let original = context("q0", json!({"status": "open"}), 0);
        let previous = context("q1", json!({"status": "won"}), 1);
        let chain = ContextChain::new(Some(previous), Some(original.clone()));
        let turn = chain.begin_turn("what about these", false, 3).unwrap();
        let next = turn.commit_narrative().unwrap();
        assert!(next.previous.as_ref().unwrap().same_turn(&original));
        assert_eq!(next.previous.as_ref().unwrap().depth, 2);
        assert_eq!(next.original, Some(original));
    }

    #[test]
    fn test_narrative_follow_ups_count_toward_limit() {
        let mut chain = root_chain();
        for expected in 1..=3 {
            let turn = chain.begin_turn("what do these have in common", false, 3).unwrap();
            assert_eq!(turn.depth, expected);
            chain = turn.commit_narrative().unwrap();
        }
        assert_eq!(chain.state(3), ChainState::Exhausted);
        let err = chain.begin_turn("what do these have in common", false, 3).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn test_from_history() {
        let root = context("q0", json!({"status": "open"}), 0);
        let follow = context("q1", json!({"limit": 5}), 1);
        let chain = ContextChain::from_history(&[
            TurnOutcome::Answered(root.clone()),
            TurnOutcome::Answered(follow.clone()),
            TurnOutcome::Failed,
        ]);
        assert_eq!(chain.previous, Some(follow));

        let chain = ContextChain::from_history(&[
            TurnOutcome::Answered(root.clone()),
            TurnOutcome::Answered(context("q1", json!({}), 1)),
            TurnOutcome::Narrative,
        ]);
        let previous = chain.previous.unwrap();
        assert!(previous.same_turn(&root));
        assert_eq!(previous.depth, 2);
        assert_eq!(chain.original, Some(root));
    }

    #[test]
    fn test_markers_carry_through_chain() {
        let mut original = context("projects for Springfield [filter by City: \"Springfield\"]", json!({}), 0);
        original.result_rows = None;
        let chain = ContextChain::new(Some(original.clone()), Some(original));
        let turn = chain.begin_turn("top 3 of these", false, 3).unwrap();
        assert_eq!(
            turn.carried_markers(),
            vec![FilterMarker {
                column: "City".into(),
                term: "Springfield".into()
            }]
        );
    }

    #[test]
    fn test_singular() {
        assert_eq!(singular("cities"), "city");
        assert_eq!(singular("statuses"), "status");
        assert_eq!(singular("clients"), "client");
        assert_eq!(singular("region"), "region");
    }
}
