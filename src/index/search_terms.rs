//! Search term derivation for indexed column values.
//!
//! Every canonical value contributes its lowercased full text, its words of
//! three or more characters, and any parenthetical abbreviation. Full values
//! are inserted before words, and after that the first writer wins: two values
//! sharing a short word map it to whichever sorts first. Resolution re-verifies
//! every hit against the data source, so the collision only costs a tier miss.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    static ref PARENTHETICAL: Regex = Regex::new(r"\(([^()]+)\)").unwrap();
}

const MIN_WORD_LEN: usize = 3;
const STOP_WORDS: &[&str] = &["the", "and", "for"];

/// Lowercase, trim, collapse inner whitespace.
pub fn normalize(term: &str) -> String {
    term.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, '/' | '-' | '(' | ')' | ',')
}

/// Words of a value that are long enough to be searched on their own.
pub fn tokenize(value: &str) -> Vec<String> {
    value
        .to_lowercase()
        .split(is_separator)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '&'))
        .filter(|w| w.chars().count() >= MIN_WORD_LEN && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// `"Port Authority (PANYNJ)"` → `["panynj"]`.
pub fn abbreviations(value: &str) -> Vec<String> {
    PARENTHETICAL
        .captures_iter(value)
        .filter_map(|c| c.get(1))
        .map(|m| normalize(m.as_str()))
        .filter(|a| !a.is_empty())
        .collect()
}

/// Builds the term → canonical value map for one column.
pub fn build_search_terms(values: &BTreeSet<String>) -> BTreeMap<String, String> {
    let mut terms: BTreeMap<String, String> = BTreeMap::new();

    for value in values {
        terms.entry(normalize(value)).or_insert_with(|| value.clone());
    }
    for value in values {
        for abbrev in abbreviations(value) {
            terms.entry(abbrev).or_insert_with(|| value.clone());
        }
        for word in tokenize(value) {
            terms.entry(word).or_insert_with(|| value.clone());
        }
    }
    terms
}

/// Terms that differ from the lowercased canonical value they map to.
pub fn derive_aliases(terms: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    terms
        .iter()
        .filter(|(term, canonical)| **term != normalize(canonical))
        .map(|(term, canonical)| (term.clone(), canonical.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_tokenize_splits_on_separators() {
        assert_eq!(
            tokenize("Highway/Bridge - Design (Phase II), Rehab"),
            vec!["highway", "bridge", "design", "phase", "rehab"]
        );
        assert!(tokenize("of a to").is_empty());
    }

    #[test]
    fn test_abbreviation_extraction() {
        assert_eq!(abbreviations("Port Authority (PANYNJ)"), vec!["panynj"]);
        assert!(abbreviations("No Parens").is_empty());
    }

    #[test]
    fn test_search_terms_include_full_words_and_abbrev() {
        let terms = build_search_terms(&set(&["Port Authority (PANYNJ)"]));
        assert_eq!(terms.get("port authority (panynj)").map(String::as_str), Some("Port Authority (PANYNJ)"));
        assert_eq!(terms.get("panynj").map(String::as_str), Some("Port Authority (PANYNJ)"));
        assert_eq!(terms.get("authority").map(String::as_str), Some("Port Authority (PANYNJ)"));
    }

    #[test]
    fn test_first_writer_wins_on_shared_words() {
        let terms = build_search_terms(&set(&["Highway Design", "Highway Maintenance"]));
        assert_eq!(terms.get("highway").map(String::as_str), Some("Highway Design"));
        assert_eq!(terms.get("maintenance").map(String::as_str), Some("Highway Maintenance"));
    }

    #[test]
    fn test_full_value_beats_word_of_other_value() {
        let terms = build_search_terms(&set(&["Bridge", "Aaron Bridge Works"]));
        assert_eq!(terms.get("bridge").map(String::as_str), Some("Bridge"));
    }

    #[test]
    fn test_aliases_exclude_full_values() {
        let terms = build_search_terms(&set(&["Transit (Rail)"]));
        let aliases = derive_aliases(&terms);
        assert!(aliases.contains_key("rail"));
        assert!(aliases.contains_key("transit"));
        assert!(!aliases.contains_key("transit (rail)"));
    }
}
