//! Postgres data source
//!
//! Queries are wrapped in `json_agg` so every template comes back as a list of
//! JSON objects regardless of its projection.

use super::connection::{init_pool, is_connection_lost, is_transient};
use super::DataSource;
use crate::error::{EngineError, Result};
use crate::query::plan::{ParamValue, ParameterizedQuery, Row};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::PgPool;
use std::future::Future;
use tokio::sync::RwLock;
use tracing::{debug, warn};

lazy_static! {
    static ref NAMED_PARAM: Regex = Regex::new(r"@p(\d+)").unwrap();
}

/// Shared pool tagged with a generation that increments on every rebuild.
struct PoolSlot<P> {
    current: RwLock<(u64, P)>,
}

impl<P: Clone> PoolSlot<P> {
    fn new(pool: P) -> Self {
        Self {
            current: RwLock::new((0, pool)),
        }
    }

    async fn get(&self) -> (u64, P) {
        self.current.read().await.clone()
    }

    /// Swaps in a pool from `build` unless generation `seen` was already
    /// replaced. Returns the retired pool when this call did the swap.
    async fn rebuild<F, Fut, E>(&self, seen: u64, build: F) -> std::result::Result<Option<P>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<P, E>>,
    {
        let mut guard = self.current.write().await;
        if guard.0 != seen {
            debug!(seen, current = guard.0, "Pool already rebuilt");
            return Ok(None);
        }
        let fresh = build().await?;
        let old = std::mem::replace(&mut guard.1, fresh);
        guard.0 += 1;
        Ok(Some(old))
    }
}

pub struct PgDataSource {
    database_url: String,
    max_connections: u32,
    pool: PoolSlot<PgPool>,
}

impl PgDataSource {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = init_pool(database_url, max_connections)
            .await
            .map_err(|e| classify(&e))?;
        Ok(Self {
            database_url: database_url.to_string(),
            max_connections,
            pool: PoolSlot::new(pool),
        })
    }

    /// Replaces the pool of generation `seen` after a dropped connection.
    /// Concurrent callers that saw the same generation rebuild it once.
    async fn recreate_pool(&self, seen: u64) -> Result<()> {
        let retired = self
            .pool
            .rebuild(seen, || async {
                warn!("Recreating Postgres pool after connection loss");
                init_pool(&self.database_url, self.max_connections).await
            })
            .await
            .map_err(|e| classify(&e))?;
        if let Some(old) = retired {
            tokio::spawn(async move { old.close().await });
        }
        Ok(())
    }

    async fn run(&self, pool: &PgPool, sql: &str, params: &[(String, ParamValue)]) -> std::result::Result<Vec<Row>, sqlx::Error> {
        let mut query = sqlx::query_scalar::<_, serde_json::Value>(sql);
        for (_, value) in params {
            query = match value {
                ParamValue::Integer(v) => query.bind(*v),
                ParamValue::Float(v) => query.bind(*v),
                ParamValue::Date(v) => query.bind(*v),
                ParamValue::Text(v) => query.bind(v.clone()),
            };
        }
        let value = query.fetch_one(pool).await?;
        let rows = match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    serde_json::Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(rows)
    }
}

#[async_trait]
impl DataSource for PgDataSource {
    async fn query(&self, query: &ParameterizedQuery) -> Result<Vec<Row>> {
        let sql = to_positional(&query.sql);
        let wrapped = format!("SELECT COALESCE(json_agg(t), '[]'::json) FROM ({}) AS t", sql);
        debug!(sql = %wrapped, params = query.params.len(), "Executing query");

        let (generation, pool) = self.pool.get().await;
        match self.run(&pool, &wrapped, &query.params).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                if is_connection_lost(&e) {
                    if let Err(reconnect_err) = self.recreate_pool(generation).await {
                        warn!("Pool recreation failed: {}", reconnect_err);
                    }
                }
                Err(classify(&e))
            }
        }
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

/// `@p1` → `$1`; Postgres only understands positional placeholders.
pub fn to_positional(sql: &str) -> String {
    NAMED_PARAM.replace_all(sql, "$$$1").to_string()
}

fn classify(error: &sqlx::Error) -> EngineError {
    if is_transient(error) {
        EngineError::transient(error.to_string())
    } else {
        EngineError::permanent(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_named_to_positional() {
        assert_eq!(
            to_positional("SELECT * FROM \"projects\" WHERE \"Status\" IN (@p1, @p2) AND \"Client\" LIKE @p10"),
            "SELECT * FROM \"projects\" WHERE \"Status\" IN ($1, $2) AND \"Client\" LIKE $10"
        );
    }

    #[tokio::test]
    async fn test_concurrent_failures_rebuild_the_pool_once() {
        let slot = Arc::new(PoolSlot::new("first".to_string()));
        let builds = Arc::new(AtomicU32::new(0));
        let (seen, _) = slot.get().await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let slot = Arc::clone(&slot);
            let builds = Arc::clone(&builds);
            tasks.spawn(async move {
                slot.rebuild(seen, || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    Ok::<_, String>("second".to_string())
                })
                .await
            });
        }
        let mut retired = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Some(old) = result.unwrap().unwrap() {
                retired.push(old);
            }
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(retired, vec!["first".to_string()]);
        assert_eq!(slot.get().await, (1, "second".to_string()));
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_generation() {
        let slot = PoolSlot::new(1u8);
        let result = slot.rebuild(0, || async { Err::<u8, _>("refused") }).await;
        assert_eq!(result, Err("refused"));
        assert_eq!(slot.get().await, (0, 1));
        assert_eq!(slot.rebuild(0, || async { Ok::<_, ()>(2) }).await, Ok(Some(1)));
    }
}
