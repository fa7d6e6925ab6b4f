//! Query Executor
//!
//! Runs compiled queries with bounded retry on transient data source errors.
//! Non-transient errors (syntax, constraint) propagate on the first attempt.

use crate::config::RetryPolicy;
use crate::db::DataSource;
use crate::error::{EngineError, Result};
use crate::query::plan::{ParameterizedQuery, Row, COUNT_ALIAS};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct QueryExecutor {
    source: Arc<dyn DataSource>,
    retry: RetryPolicy,
}

impl QueryExecutor {
    pub fn new(source: Arc<dyn DataSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub async fn execute(&self, query: &ParameterizedQuery) -> Result<Vec<Row>> {
        let mut attempt = 0;
        loop {
            match self.source.query(query).await {
                Ok(rows) => {
                    debug!(rows = rows.len(), attempt, "Query succeeded");
                    return Ok(rows);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        "Transient {} error (attempt {}/{}), retrying in {:?}: {}",
                        self.source.name(),
                        attempt,
                        self.retry.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Executes a `COUNT(*)` plan and reads the single count cell.
    pub async fn count(&self, query: &ParameterizedQuery) -> Result<i64> {
        let rows = self.execute(query).await?;
        let cell = rows
            .first()
            .and_then(|row| row.get(COUNT_ALIAS))
            .ok_or_else(|| EngineError::permanent("count query returned no rows"))?;
        cell.as_i64()
            .or_else(|| cell.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| EngineError::permanent(format!("count query returned {}", cell)))
    }
}
