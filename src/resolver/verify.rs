//! Verification queries
//!
//! Every match the resolver reports is confirmed with a live `COUNT(*)`.
//! Verification is an idempotent read, so probes across columns run
//! concurrently.

use crate::disambiguation::ColumnCount;
use crate::error::Result;
use crate::query::executor::QueryExecutor;
use crate::query::plan::{Filter, Projection, QueryPlan};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Verifier {
    executor: Arc<QueryExecutor>,
    table: String,
    like: &'static str,
}

impl Verifier {
    pub fn new(executor: Arc<QueryExecutor>, table: impl Into<String>, like: &'static str) -> Self {
        Self {
            executor,
            table: table.into(),
            like,
        }
    }

    /// `COUNT(*) WHERE column LIKE '%value%'`
    pub async fn count_contains(&self, column: &str, value: &str) -> Result<i64> {
        let query = QueryPlan::new(&self.table, Projection::Count)
            .filter(Filter::Contains {
                column: column.to_string(),
                value: value.to_string(),
            })
            .compile(self.like);
        self.executor.count(&query).await
    }

    /// `COUNT(*) WHERE column IN (...)`
    pub async fn count_in(&self, column: &str, values: &[String]) -> Result<i64> {
        let query = QueryPlan::new(&self.table, Projection::Count)
            .filter(Filter::In {
                column: column.to_string(),
                values: values.to_vec(),
            })
            .compile(self.like);
        self.executor.count(&query).await
    }

    /// Counts `term` in every column at once. Failed probes count as zero.
    /// Results come back in the order of `columns`.
    pub async fn probe(&self, columns: &[String], term: &str) -> Vec<ColumnCount> {
        let mut tasks = JoinSet::new();
        for (position, column) in columns.iter().enumerate() {
            let verifier = self.clone();
            let column = column.clone();
            let term = term.to_string();
            tasks.spawn(async move {
                let count = match verifier.count_contains(&column, &term).await {
                    Ok(count) => count,
                    Err(e) => {
                        warn!("Probe of '{}' in {} failed, treating as miss: {}", term, column, e);
                        0
                    }
                };
                (position, ColumnCount { column, count })
            });
        }

        let mut results: Vec<(usize, ColumnCount)> = Vec::with_capacity(columns.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }
        results.sort_by_key(|(position, _)| *position);
        let counts: Vec<ColumnCount> = results.into_iter().map(|(_, c)| c).collect();
        debug!(term = %term, ?counts, "Direct probe finished");
        counts
    }
}
