//! In-memory data source
//!
//! Loads fixture rows into an in-memory SQLite table and runs the compiled
//! SQL against it with its named parameters. Used for fixture snapshots in
//! tests and for the CLI's `--fixture` mode.
//!
//! SQLite has no `ILIKE`: the keyword is rewritten to `LIKE` and the
//! connection's `case_sensitive_like` pragma follows whichever keyword the
//! query used.

use super::DataSource;
use crate::config::ColumnConfig;
use crate::error::{EngineError, Result};
use crate::query::plan::{quote_ident, ParamValue, ParameterizedQuery, Row};
use async_trait::async_trait;
use itertools::Itertools;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode, ToSql};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_TABLE: &str = "projects";

pub struct MemoryDataSource {
    conn: Mutex<Connection>,
    row_count: usize,
    executed: Mutex<Vec<String>>,
    pending_failures: AtomicUsize,
}

impl MemoryDataSource {
    /// Rows served as the default `projects` table with the default columns.
    pub fn new(rows: Vec<Row>) -> Result<Self> {
        Self::with_schema(DEFAULT_TABLE, &ColumnConfig::default(), rows)
    }

    /// Creates `table` with every configured column plus any extra keys the
    /// rows carry. Columns a row lacks are stored as NULL.
    pub fn with_schema(table: &str, columns: &ColumnConfig, rows: Vec<Row>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| classify(&e))?;
        let names: Vec<String> = columns
            .all_columns()
            .into_iter()
            .chain(rows.iter().flat_map(|row| row.keys().cloned()))
            .unique()
            .collect();

        let quoted = names.iter().map(|c| quote_ident(c)).join(", ");
        conn.execute(&format!("CREATE TABLE {} ({})", quote_ident(table), quoted), [])
            .map_err(|e| classify(&e))?;

        let placeholders = (1..=names.len()).map(|i| format!("?{}", i)).join(", ");
        let insert = format!("INSERT INTO {} ({}) VALUES ({})", quote_ident(table), quoted, placeholders);
        {
            let mut stmt = conn.prepare(&insert).map_err(|e| classify(&e))?;
            for row in &rows {
                let values: Vec<SqlValue> = names.iter().map(|c| to_sql_value(row.get(c))).collect();
                stmt.execute(rusqlite::params_from_iter(values.iter()))
                    .map_err(|e| classify(&e))?;
            }
        }
        debug!(table, columns = names.len(), rows = rows.len(), "Fixture table loaded");

        Ok(Self {
            conn: Mutex::new(conn),
            row_count: rows.len(),
            executed: Mutex::new(Vec::new()),
            pending_failures: AtomicUsize::new(0),
        })
    }

    /// Loads a JSON array of objects into the configured table.
    pub fn from_json_file(path: &Path, table: &str, columns: &ColumnConfig) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let rows: Vec<Row> = serde_json::from_str(&raw)?;
        Self::with_schema(table, columns, rows)
    }

    /// The next `count` queries fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// SQL text of every query received so far.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    fn run(&self, query: &ParameterizedQuery) -> Result<Vec<Row>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::permanent("in-memory connection poisoned"))?;
        let (sql, case_sensitive) = sqlite_dialect(&query.sql);
        conn.pragma_update(None, "case_sensitive_like", case_sensitive)
            .map_err(|e| classify(&e))?;

        let mut stmt = conn.prepare(&sql).map_err(|e| classify(&e))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let params: Vec<(&str, &dyn ToSql)> = query
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        let mut rows = stmt.query(params.as_slice()).map_err(|e| classify(&e))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| classify(&e))? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(|e| classify(&e))?;
                record.insert(name.clone(), to_json(value));
            }
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn query(&self, query: &ParameterizedQuery) -> Result<Vec<Row>> {
        if let Ok(mut log) = self.executed.lock() {
            log.push(query.sql.clone());
        }
        let pending = self.pending_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_failures.store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::transient("connection reset by peer"));
        }
        self.run(query)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl ToSql for ParamValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            ParamValue::Integer(v) => SqlValue::Integer(*v),
            ParamValue::Float(v) => SqlValue::Real(*v),
            // ISO dates compare correctly as text
            ParamValue::Date(v) => SqlValue::Text(v.format("%Y-%m-%d").to_string()),
            ParamValue::Text(v) => SqlValue::Text(v.clone()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// `ILIKE` → `LIKE`, and whether `LIKE` must stay case-sensitive.
fn sqlite_dialect(sql: &str) -> (String, bool) {
    if sql.contains(" ILIKE ") {
        (sql.replace(" ILIKE ", " LIKE "), false)
    } else {
        (sql.to_string(), true)
    }
}

fn to_sql_value(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn classify(error: &rusqlite::Error) -> EngineError {
    match error {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            EngineError::transient(error.to_string())
        }
        _ => EngineError::permanent(error.to_string()),
    }
}
