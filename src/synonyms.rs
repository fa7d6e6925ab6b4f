//! Synonym Tables
//!
//! Static alias tables for status groups and regions, plus project-type
//! aliases derived from the column index at each refresh. Canonical values in
//! the static tables are literal column values and are never expanded again.

use crate::index::{normalize, ColumnSnapshot};
use std::collections::{BTreeMap, HashMap};

const STATUS_GROUPS: &[(&str, &[&str])] = &[
    (
        "open",
        &["Submitted", "Pending", "In Review", "Under Consideration", "Active", "In Progress"],
    ),
    (
        "ongoing",
        &["Submitted", "Pending", "In Review", "Under Consideration", "Active", "In Progress"],
    ),
    ("active", &["Active", "In Progress"]),
    ("in progress", &["In Progress"]),
    ("pending", &["Pending", "Submitted", "In Review", "Under Consideration"]),
    ("under review", &["In Review", "Under Consideration"]),
    ("submitted", &["Submitted"]),
    ("closed", &["Closed", "Completed", "Cancelled", "Lost", "Not Awarded"]),
    ("completed", &["Completed", "Closed"]),
    ("complete", &["Completed", "Closed"]),
    ("finished", &["Completed", "Closed"]),
    ("done", &["Completed", "Closed"]),
    ("won", &["Won", "Awarded"]),
    ("awarded", &["Won", "Awarded"]),
    ("lost", &["Lost", "Not Awarded"]),
    ("rejected", &["Lost", "Not Awarded"]),
    ("cancelled", &["Cancelled"]),
    ("canceled", &["Cancelled"]),
    ("on hold", &["On Hold"]),
    ("paused", &["On Hold"]),
];

const REGION_ALIASES: &[(&str, &[&str])] = &[
    ("mena", &["MENA"]),
    ("uae", &["MENA"]),
    ("u.a.e", &["MENA"]),
    ("united arab emirates", &["MENA"]),
    ("dubai", &["MENA"]),
    ("abu dhabi", &["MENA"]),
    ("middle east", &["MENA"]),
    ("gulf", &["MENA"]),
    ("gcc", &["MENA"]),
    ("saudi", &["MENA"]),
    ("saudi arabia", &["MENA"]),
    ("ksa", &["MENA"]),
    ("qatar", &["MENA"]),
    ("north africa", &["MENA"]),
    ("apac", &["APAC"]),
    ("asia", &["APAC"]),
    ("asia pacific", &["APAC"]),
    ("australia", &["APAC"]),
    ("india", &["APAC"]),
    ("europe", &["Europe"]),
    ("eu", &["Europe"]),
    ("uk", &["Europe"]),
    ("united kingdom", &["Europe"]),
    ("latam", &["LATAM"]),
    ("latin america", &["LATAM"]),
    ("south america", &["LATAM"]),
    ("northeast", &["Northeast"]),
    ("north east", &["Northeast"]),
    ("new england", &["Northeast"]),
    ("tri-state", &["Northeast"]),
    ("tristate", &["Northeast"]),
    ("southeast", &["Southeast"]),
    ("south east", &["Southeast"]),
    ("midwest", &["Midwest"]),
    ("mid west", &["Midwest"]),
    ("west coast", &["West"]),
    ("west", &["West"]),
    ("east coast", &["Northeast", "Southeast"]),
];

/// Alias → canonical values for statuses and regions.
#[derive(Debug, Clone)]
pub struct SynonymTables {
    statuses: HashMap<String, Vec<String>>,
    regions: HashMap<String, Vec<String>>,
}

impl Default for SynonymTables {
    fn default() -> Self {
        Self {
            statuses: to_table(STATUS_GROUPS),
            regions: to_table(REGION_ALIASES),
        }
    }
}

fn to_table(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(alias, values)| {
            (
                alias.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

/// Strips filler that users attach to status and region mentions.
fn clean(term: &str) -> String {
    let term = normalize(term);
    let term = term.trim_matches(|c: char| c == '.' || c == '"' || c == '\'' || c == '?');
    let term = term
        .strip_suffix(" projects")
        .or_else(|| term.strip_suffix(" region"))
        .or_else(|| term.strip_suffix(" status"))
        .unwrap_or(term);
    let term = term.strip_prefix("the ").unwrap_or(term);
    term.trim().to_string()
}

impl SynonymTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a status group.
    pub fn with_status_group(mut self, alias: &str, values: &[&str]) -> Self {
        self.statuses
            .insert(clean(alias), values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_region_alias(mut self, alias: &str, values: &[&str]) -> Self {
        self.regions
            .insert(clean(alias), values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn resolve_status(&self, term: &str) -> Option<Vec<String>> {
        self.statuses.get(&clean(term)).cloned()
    }

    pub fn resolve_region(&self, term: &str) -> Option<Vec<String>> {
        self.regions.get(&clean(term)).cloned()
    }

    pub fn status_aliases(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.statuses.iter()
    }

    pub fn region_aliases(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.regions.iter()
    }
}

/// Project-type aliases, read from the aliases the column snapshot derived
/// when it was refreshed.
#[derive(Debug, Clone, Copy)]
pub struct ProjectTypeSynonyms<'a> {
    aliases: &'a BTreeMap<String, String>,
}

impl<'a> ProjectTypeSynonyms<'a> {
    pub fn of(snapshot: &'a ColumnSnapshot) -> Self {
        Self {
            aliases: &snapshot.aliases,
        }
    }

    pub fn resolve(&self, term: &str) -> Option<&'a String> {
        self.aliases.get(&clean(term))
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}
