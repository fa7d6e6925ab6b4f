#![allow(dead_code)]

use projects_nlq::classifier::{Classification, ScriptedClassifier};
use projects_nlq::config::RetryPolicy;
use projects_nlq::db::MemoryDataSource;
use projects_nlq::query::Row;
use projects_nlq::{EngineConfig, QueryEngine, QueryResponse};
use serde_json::Value;
use std::sync::Arc;

const PROJECTS: &str = include_str!("../../demos/projects.json");

pub fn project_rows() -> Vec<Row> {
    serde_json::from_str(PROJECTS).unwrap()
}

pub fn config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
        },
        ..EngineConfig::default()
    }
}

pub struct Fixture {
    pub engine: QueryEngine,
    pub source: Arc<MemoryDataSource>,
    pub classifier: Arc<ScriptedClassifier>,
}

pub fn fixture(script: Vec<Classification>) -> Fixture {
    fixture_with(config(), script)
}

pub fn fixture_with(config: EngineConfig, script: Vec<Classification>) -> Fixture {
    let classifier = Arc::new(
        script
            .into_iter()
            .fold(ScriptedClassifier::new(), |scripted, c| scripted.then(c)),
    );
    let source = Arc::new(MemoryDataSource::new(project_rows()).unwrap());
    let engine = QueryEngine::builder(config, source.clone(), classifier.clone()).build();
    Fixture {
        engine,
        source,
        classifier,
    }
}

pub fn classify(template: &str, arguments: Value) -> Classification {
    Classification::new(template, arguments)
}

pub fn rows_of(response: &QueryResponse) -> &[Row] {
    match response {
        QueryResponse::Tabular(result) => &result.rows,
        other => panic!("expected a table, got {:?}", other),
    }
}

pub fn column_values<'a>(rows: &'a [Row], column: &str) -> Vec<&'a str> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(Value::as_str))
        .collect()
}
