//! Disambiguation Detector
//!
//! A term is ambiguous when the direct probe finds it in more than one column
//! and the policy does not let the top column win outright. The engine keeps no
//! pending state: the caller resubmits the question with a
//! `[filter by <column>: "<term>"]` marker naming the chosen column.

use crate::config::DisambiguationPolicy;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref MARKER: Regex =
        Regex::new(r#"(?i)\s*\[filter by\s+([^:\]]+?)\s*:\s*"([^"]*)"\s*\]"#).unwrap();
}

/// Verified match count of a term in one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnCount {
    pub column: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisambiguationOption {
    pub column: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disambiguation {
    pub term: String,
    pub options: Vec<DisambiguationOption>,
}

pub struct DisambiguationDetector {
    policy: DisambiguationPolicy,
}

impl DisambiguationDetector {
    pub fn new(policy: DisambiguationPolicy) -> Self {
        Self { policy }
    }

    /// Returns the choice payload when `counts` (in probe priority order) is
    /// ambiguous under the policy.
    pub fn detect(&self, term: &str, counts: &[ColumnCount]) -> Option<Disambiguation> {
        let mut hits: Vec<&ColumnCount> = counts.iter().filter(|c| c.count > 0).collect();
        if hits.len() < 2 {
            return None;
        }
        // stable: equal counts keep probe priority order
        hits.sort_by(|a, b| b.count.cmp(&a.count));

        if let Some(ratio) = self.policy.dominance_ratio {
            let top = hits[0].count as f64;
            let second = hits[1].count as f64;
            if top / second >= ratio {
                return None;
            }
        }

        Some(Disambiguation {
            term: term.to_string(),
            options: hits
                .into_iter()
                .map(|c| DisambiguationOption {
                    column: c.column.clone(),
                    display_name: display_name(&c.column),
                    count: c.count,
                })
                .collect(),
        })
    }
}

/// `ProjectType` → `Project Type`.
pub fn display_name(column: &str) -> String {
    let mut out = String::with_capacity(column.len() + 4);
    let chars: Vec<char> = column.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if *c == '_' {
            out.push(' ');
            continue;
        }
        let boundary = i > 0
            && c.is_uppercase()
            && (chars[i - 1].is_lowercase()
                || (chars[i - 1].is_uppercase()
                    && chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false)));
        if boundary {
            out.push(' ');
        }
        out.push(*c);
    }
    out
}

/// A column choice embedded in a resubmitted question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMarker {
    pub column: String,
    pub term: String,
}

/// Appends a marker for `term`, replacing any earlier marker for the same term.
pub fn annotate(question: &str, column: &str, term: &str) -> String {
    let stripped = MARKER.replace_all(question, |caps: &regex::Captures| {
        if caps[2].trim().eq_ignore_ascii_case(term.trim()) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    format!("{} [filter by {}: \"{}\"]", stripped.trim_end(), column, term.trim())
}

/// Splits markers out of a question. The last marker for a term wins.
pub fn parse_markers(question: &str) -> (String, Vec<FilterMarker>) {
    let mut markers: Vec<FilterMarker> = Vec::new();
    for caps in MARKER.captures_iter(question) {
        let marker = FilterMarker {
            column: caps[1].trim().to_string(),
            term: caps[2].trim().to_string(),
        };
        markers.retain(|m| !m.term.eq_ignore_ascii_case(&marker.term));
        markers.push(marker);
    }
    let clean = MARKER.replace_all(question, "").trim().to_string();
    (clean, markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, i64)]) -> Vec<ColumnCount> {
        pairs
            .iter()
            .map(|(column, count)| ColumnCount {
                column: column.to_string(),
                count: *count,
            })
            .collect()
    }

    #[test]
    fn test_two_columns_are_ambiguous_sorted_by_count() {
        let detector = DisambiguationDetector::new(DisambiguationPolicy::default());
        let result = detector
            .detect("Springfield", &counts(&[("City", 5), ("Client", 12), ("Region", 0)]))
            .unwrap();
        let order: Vec<(&str, i64)> = result.options.iter().map(|o| (o.column.as_str(), o.count)).collect();
        assert_eq!(order, vec![("Client", 12), ("City", 5)]);
    }

    #[test]
    fn test_single_column_never_ambiguous() {
        let detector = DisambiguationDetector::new(DisambiguationPolicy::default());
        assert!(detector.detect("LiRo", &counts(&[("Company", 40), ("Client", 0)])).is_none());
        assert!(detector.detect("x", &[]).is_none());
    }

    #[test]
    fn test_lopsided_counts_with_dominance_policy() {
        let detector = DisambiguationDetector::new(DisambiguationPolicy {
            dominance_ratio: Some(10.0),
        });
        assert!(detector.detect("Metro", &counts(&[("Client", 200), ("City", 3)])).is_none());
        assert!(detector.detect("Metro", &counts(&[("Client", 20), ("City", 3)])).is_some());
    }

    #[test]
    fn test_default_policy_asks_even_when_lopsided() {
        let detector = DisambiguationDetector::new(DisambiguationPolicy::default());
        assert!(detector.detect("Metro", &counts(&[("Client", 900), ("City", 1)])).is_some());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(display_name("ProjectType"), "Project Type");
        assert_eq!(display_name("RequestCategory"), "Request Category");
        assert_eq!(display_name("Client"), "Client");
        assert_eq!(display_name("request_category"), "request category");
    }

    #[test]
    fn test_annotate_replaces_previous_marker_for_term() {
        let once = annotate("show projects for Springfield", "City", "Springfield");
        assert_eq!(once, "show projects for Springfield [filter by City: \"Springfield\"]");
        let twice = annotate(&once, "Client", "springfield");
        assert_eq!(twice.matches("[filter by").count(), 1);
        assert!(twice.ends_with("[filter by Client: \"springfield\"]"));
    }

    #[test]
    fn test_annotate_keeps_markers_for_other_terms() {
        let q = annotate("projects for Springfield in Ohio", "City", "Springfield");
        let q = annotate(&q, "State", "Ohio");
        let (clean, markers) = parse_markers(&q);
        assert_eq!(clean, "projects for Springfield in Ohio");
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[1], FilterMarker { column: "State".into(), term: "Ohio".into() });
    }
}
