//! Column Value Index
//!
//! Distinct values per searchable column, refreshed from the data source and
//! swapped in per column. Readers clone an `Arc<ColumnSnapshot>` and never see
//! a partially built snapshot.

use super::search_terms::{build_search_terms, derive_aliases, normalize};
use crate::error::Result;
use crate::query::executor::QueryExecutor;
use crate::query::plan::{Filter, Projection, QueryPlan};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use strsim::jaro_winkler;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Immutable view of one column for one refresh cycle.
#[derive(Debug, Clone)]
pub struct ColumnSnapshot {
    pub column: String,
    pub values: BTreeSet<String>,
    /// Normalized term → canonical value.
    pub search_terms: BTreeMap<String, String>,
    /// Search terms that differ from their canonical value.
    pub aliases: BTreeMap<String, String>,
    pub refreshed_at: DateTime<Utc>,
}

impl ColumnSnapshot {
    pub fn build(column: impl Into<String>, values: impl IntoIterator<Item = String>) -> Self {
        Self::build_at(column, values, Utc::now())
    }

    pub fn build_at(
        column: impl Into<String>,
        values: impl IntoIterator<Item = String>,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        let values: BTreeSet<String> = values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        let search_terms = build_search_terms(&values);
        let aliases = derive_aliases(&search_terms);
        Self {
            column: column.into(),
            values,
            search_terms,
            aliases,
            refreshed_at,
        }
    }

    pub fn exact(&self, term: &str) -> Option<&String> {
        self.search_terms.get(&normalize(term))
    }

    /// First term (in sorted order) that contains `term` or is contained by it.
    pub fn substring(&self, term: &str) -> Option<&String> {
        let needle = normalize(term);
        if needle.is_empty() {
            return None;
        }
        self.search_terms
            .iter()
            .find(|(token, _)| needle.contains(token.as_str()) || token.contains(&needle))
            .map(|(_, canonical)| canonical)
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.refreshed_at
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
    pub value_counts: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarValue {
    pub column: String,
    pub value: String,
    pub score: f64,
}

pub struct ColumnValueIndex {
    table: String,
    columns: Vec<String>,
    refresh_interval: Duration,
    snapshots: DashMap<String, Arc<ColumnSnapshot>>,
}

impl ColumnValueIndex {
    pub fn new(table: impl Into<String>, columns: Vec<String>, refresh_interval: Duration) -> Self {
        Self {
            table: table.into(),
            columns,
            refresh_interval,
            snapshots: DashMap::new(),
        }
    }

    /// Builds an index from fixture values without touching a data source.
    pub fn from_values(
        table: impl Into<String>,
        refresh_interval: Duration,
        values: HashMap<String, Vec<String>>,
    ) -> Self {
        let mut columns: Vec<String> = values.keys().cloned().collect();
        columns.sort();
        let index = Self::new(table, columns, refresh_interval);
        for (column, column_values) in values {
            index.install(Arc::new(ColumnSnapshot::build(column, column_values)));
        }
        index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Atomically replaces one column's snapshot.
    pub fn install(&self, snapshot: Arc<ColumnSnapshot>) {
        self.snapshots.insert(snapshot.column.clone(), snapshot);
    }

    pub fn snapshot(&self, column: &str) -> Option<Arc<ColumnSnapshot>> {
        self.snapshots.get(column).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_initialized(&self) -> bool {
        self.columns.iter().all(|c| self.snapshots.contains_key(c))
    }

    /// True when a column was never loaded or the oldest snapshot is stale.
    pub fn needs_refresh(&self) -> bool {
        if !self.is_initialized() {
            return true;
        }
        let interval = chrono::Duration::from_std(self.refresh_interval)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.snapshots
            .iter()
            .map(|entry| entry.value().age())
            .max()
            .map(|oldest| oldest > interval)
            .unwrap_or(true)
    }

    /// Reloads every column concurrently. A failed column keeps its previous
    /// snapshot; the report lists it under `failed`.
    pub async fn refresh(&self, executor: Arc<QueryExecutor>, like: &str) -> RefreshReport {
        let mut tasks: JoinSet<(String, Result<ColumnSnapshot>)> = JoinSet::new();
        for column in &self.columns {
            let executor = Arc::clone(&executor);
            let query = distinct_values_plan(&self.table, column).compile(like);
            let column = column.clone();
            tasks.spawn(async move {
                let result = executor.execute(&query).await.map(|rows| {
                    let values = rows.into_iter().filter_map(|row| {
                        row.get(&column).and_then(|v| match v {
                            serde_json::Value::String(s) => Some(s.clone()),
                            serde_json::Value::Null => None,
                            other => Some(other.to_string()),
                        })
                    });
                    ColumnSnapshot::build(column.clone(), values.collect::<Vec<_>>())
                });
                (column, result)
            });
        }

        let mut report = RefreshReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((column, Ok(snapshot))) => {
                    debug!(column = %column, values = snapshot.values.len(), "Column refreshed");
                    report.value_counts.insert(column.clone(), snapshot.values.len());
                    report.refreshed.push(column);
                    self.install(Arc::new(snapshot));
                }
                Ok((column, Err(e))) => {
                    warn!("Refresh of column '{}' failed, keeping previous snapshot: {}", column, e);
                    report.failed.push(column);
                }
                Err(e) => warn!("Refresh task panicked: {}", e),
            }
        }
        report.refreshed.sort();
        report.failed.sort();
        info!(
            "Column index refreshed: {} ok, {} failed",
            report.refreshed.len(),
            report.failed.len()
        );
        report
    }

    /// Checks staleness every `tick` and refreshes when needed.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        executor: Arc<QueryExecutor>,
        like: &'static str,
        tick: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if self.needs_refresh() {
                    self.refresh(Arc::clone(&executor), like).await;
                }
            }
        })
    }

    /// Known values closest to `term` across all columns, best first.
    pub fn similar_values(&self, term: &str, limit: usize) -> Vec<SimilarValue> {
        let needle = normalize(term);
        if needle.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<SimilarValue> = Vec::new();
        for column in &self.columns {
            let Some(snapshot) = self.snapshot(column) else {
                continue;
            };
            for value in &snapshot.values {
                let score = jaro_winkler(&needle, &normalize(value));
                if score >= 0.75 {
                    scored.push(SimilarValue {
                        column: column.clone(),
                        value: value.clone(),
                        score,
                    });
                }
            }
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.value.cmp(&b.value))
        });
        scored.dedup_by(|a, b| a.value == b.value);
        scored.truncate(limit);
        scored
    }
}

/// `SELECT DISTINCT col FROM table WHERE col IS NOT NULL AND col <> ''`
pub fn distinct_values_plan(table: &str, column: &str) -> QueryPlan {
    QueryPlan::new(table, Projection::Distinct(column.to_string())).filter(Filter::NotBlank {
        column: column.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::db::MemoryDataSource;
    use crate::query::plan::Row;
    use serde_json::json;

    fn fixture_rows() -> Vec<Row> {
        serde_json::from_value(json!([
            {"Client": "Port Authority (PANYNJ)", "Region": "Northeast"},
            {"Client": "NYC DOT", "Region": ""},
            {"Client": "NYC DOT", "Region": null}
        ]))
        .unwrap()
    }

    fn executor(source: Arc<MemoryDataSource>) -> Arc<QueryExecutor> {
        Arc::new(QueryExecutor::new(
            source,
            RetryPolicy {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
        ))
    }

    #[tokio::test]
    async fn test_refresh_builds_snapshots() {
        let source = Arc::new(MemoryDataSource::new(fixture_rows()).unwrap());
        let index = ColumnValueIndex::new(
            "projects",
            vec!["Client".into(), "Region".into()],
            Duration::from_secs(3600),
        );
        assert!(index.needs_refresh());

        let report = index.refresh(executor(source), "LIKE").await;
        assert_eq!(report.refreshed, vec!["Client", "Region"]);
        assert!(!index.needs_refresh());

        let clients = index.snapshot("Client").unwrap();
        assert_eq!(clients.values.len(), 2);
        assert_eq!(clients.exact("panynj").map(String::as_str), Some("Port Authority (PANYNJ)"));
        let regions = index.snapshot("Region").unwrap();
        assert_eq!(regions.values.iter().collect::<Vec<_>>(), vec!["Northeast"]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let source = Arc::new(MemoryDataSource::new(fixture_rows()).unwrap());
        let index = ColumnValueIndex::new("projects", vec!["Client".into()], Duration::from_secs(3600));
        index.install(Arc::new(ColumnSnapshot::build("Client", vec!["Old Client".to_string()])));

        source.fail_next(1);
        let report = index.refresh(executor(source), "LIKE").await;
        assert_eq!(report.failed, vec!["Client"]);
        let snapshot = index.snapshot("Client").unwrap();
        assert!(snapshot.values.contains("Old Client"));
    }

    #[test]
    fn test_stale_snapshot_needs_refresh() {
        let index = ColumnValueIndex::new("projects", vec!["Client".into()], Duration::from_secs(60));
        let old = Utc::now() - chrono::Duration::seconds(120);
        index.install(Arc::new(ColumnSnapshot::build_at("Client", vec!["A Corp".to_string()], old)));
        assert!(index.needs_refresh());
        index.install(Arc::new(ColumnSnapshot::build("Client", vec!["A Corp".to_string()])));
        assert!(!index.needs_refresh());
    }

    #[test]
    fn test_substring_match() {
        let snapshot = ColumnSnapshot::build("Company", vec!["LiRo Engineers".to_string()]);
        assert_eq!(snapshot.substring("liro").map(String::as_str), Some("LiRo Engineers"));
        assert_eq!(snapshot.substring("LiRo Engineers Inc").map(String::as_str), Some("LiRo Engineers"));
        assert!(snapshot.substring("acme").is_none());
    }

    #[test]
    fn test_similar_values() {
        let mut values = HashMap::new();
        values.insert("Client".to_string(), vec!["Springfield".to_string(), "Brooklyn".to_string()]);
        let index = ColumnValueIndex::from_values("projects", Duration::from_secs(60), values);
        let similar = index.similar_values("Springfeld", 3);
        assert_eq!(similar[0].value, "Springfield");
    }
}
