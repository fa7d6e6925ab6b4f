//! Engine configuration
//!
//! Defaults describe the projects dataset. A JSON file can override any field,
//! and environment variables (loaded through `dotenv`) override the file.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Postgres connection string; `None` means no live data source.
    pub database_url: Option<String>,
    pub pool_max_connections: u32,
    pub table: String,
    pub columns: ColumnConfig,
    pub refresh_interval_secs: u64,
    pub retry: RetryPolicy,
    pub llm: LlmConfig,
    pub queue: QueueConfig,
    pub disambiguation: DisambiguationPolicy,
    /// Follow-ups allowed under one root question.
    pub follow_up_limit: u32,
    /// Rows embedded into classifier context per turn.
    pub context_row_limit: usize,
    pub default_limit: u32,
    pub max_rows: u32,
    pub request_timeout_ms: u64,
    /// Emit ILIKE instead of LIKE for substring filters.
    pub case_insensitive_match: bool,
    pub max_question_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_max_connections: 20,
            table: "projects".to_string(),
            columns: ColumnConfig::default(),
            refresh_interval_secs: 3600,
            retry: RetryPolicy::default(),
            llm: LlmConfig::default(),
            queue: QueueConfig::default(),
            disambiguation: DisambiguationPolicy::default(),
            follow_up_limit: 3,
            context_row_limit: 20,
            default_limit: 100,
            max_rows: 500,
            request_timeout_ms: 60_000,
            case_insensitive_match: true,
            max_question_length: 1000,
        }
    }
}

/// Column roles for the projects table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    /// Columns whose distinct values are indexed.
    pub searchable: Vec<String>,
    /// Tier-1 cache match order.
    pub cache_priority: Vec<String>,
    /// Tier-2 direct probe order.
    pub probe_priority: Vec<String>,
    pub status: String,
    pub region: String,
    pub project_type: String,
    pub project_name: String,
    pub project_number: String,
    pub fee: String,
    pub start_date: String,
    /// Columns returned by row templates.
    pub result_columns: Vec<String>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        let s = |v: &[&str]| v.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        Self {
            searchable: s(&[
                "Client",
                "Company",
                "Region",
                "State",
                "City",
                "ProjectType",
                "Division",
                "Department",
                "RequestCategory",
                "Status",
            ]),
            cache_priority: s(&[
                "Client",
                "Company",
                "Region",
                "State",
                "ProjectType",
                "Division",
                "Department",
                "RequestCategory",
            ]),
            probe_priority: s(&["Client", "Company", "Region", "ProjectType", "Division", "City"]),
            status: "Status".to_string(),
            region: "Region".to_string(),
            project_type: "ProjectType".to_string(),
            project_name: "ProjectName".to_string(),
            project_number: "ProjectNumber".to_string(),
            fee: "Fee".to_string(),
            start_date: "StartDate".to_string(),
            result_columns: s(&[
                "ProjectNumber",
                "ProjectName",
                "Client",
                "Company",
                "Region",
                "State",
                "City",
                "ProjectType",
                "Division",
                "Status",
                "Fee",
                "StartDate",
            ]),
        }
    }
}

impl ColumnConfig {
    /// Every configured column, each once, searchable columns first.
    pub fn all_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let roles = [
            &self.status,
            &self.region,
            &self.project_type,
            &self.project_name,
            &self.project_number,
            &self.fee,
            &self.start_date,
        ];
        for column in self
            .searchable
            .iter()
            .chain(self.result_columns.iter())
            .chain(roles.into_iter())
        {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        columns
    }

    /// Every column a query may reference.
    pub fn is_known(&self, column: &str) -> bool {
        self.searchable.iter().any(|c| c == column)
            || self.result_columns.iter().any(|c| c == column)
            || [&self.fee, &self.start_date, &self.project_name, &self.project_number]
                .iter()
                .any(|c| c.as_str() == column)
    }

    /// Case-insensitive lookup of a configured column name.
    pub fn canonical(&self, column: &str) -> Option<String> {
        let wanted: String = column
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        self.searchable
            .iter()
            .chain(self.result_columns.iter())
            .find(|c| c.to_lowercase() == wanted)
            .cloned()
    }
}

/// Linear, capped backoff for transient data source errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms.saturating_mul(attempt as u64);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            acquire_timeout_ms: 10_000,
        }
    }
}

/// When two columns both match a term, ask unless the top one dominates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisambiguationPolicy {
    /// `top / second >= ratio` resolves to the top column. `None` always asks.
    pub dominance_ratio: Option<f64>,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Loads `.env`, then an optional JSON file named by `NLQ_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = match std::env::var("NLQ_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = get("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Some(table) = get("NLQ_TABLE") {
            self.table = table;
        }
        if let Some(v) = get("NLQ_REFRESH_INTERVAL_SECS") {
            self.refresh_interval_secs = parse_env("NLQ_REFRESH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("NLQ_QUEUE_WORKERS") {
            self.queue.max_concurrent = parse_env("NLQ_QUEUE_WORKERS", &v)?;
        }
        if let Some(v) = get("NLQ_POOL_SIZE") {
            self.pool_max_connections = parse_env("NLQ_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("NLQ_DOMINANCE_RATIO") {
            self.disambiguation.dominance_ratio = Some(parse_env("NLQ_DOMINANCE_RATIO", &v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() || !self.table.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(EngineError::Config(format!("invalid table name '{}'", self.table)));
        }
        if self.queue.max_concurrent == 0 {
            return Err(EngineError::Config("queue.max_concurrent must be > 0".to_string()));
        }
        if self.default_limit == 0 || self.default_limit > self.max_rows {
            return Err(EngineError::Config(format!(
                "default_limit {} must be within 1..={}",
                self.default_limit, self.max_rows
            )));
        }
        if let Some(ratio) = self.disambiguation.dominance_ratio {
            if ratio < 1.0 {
                return Err(EngineError::Config("dominance_ratio must be >= 1.0".to_string()));
            }
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} has invalid value '{}'", key, value)))
}
