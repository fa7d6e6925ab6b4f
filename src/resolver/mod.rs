//! Entity Resolver
//!
//! Turns one free-text mention into a verified `(column, value)` pair. The
//! cascade is an explicit list of strategies:
//!
//! 1. status / region synonym tables (`IN (...)`)
//! 2. project-type aliases derived from the index
//! 3. disambiguation gate (direct probe finds the term in 2+ columns)
//! 4. cache match against the column index, verified by count
//! 5. direct probe, highest count wins
//!
//! Nothing matched means `NoMatch`; the resolver never guesses.

pub mod strategy;
pub mod verify;

use crate::config::EngineConfig;
use crate::disambiguation::{ColumnCount, Disambiguation, DisambiguationDetector};
use crate::index::ColumnValueIndex;
use crate::query::plan::Filter;
use crate::synonyms::SynonymTables;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strategy::{
    CacheMatchStrategy, DirectProbeStrategy, DisambiguationGate, ProjectTypeSynonymStrategy,
    ResolutionStrategy, StrategyOutcome, SynonymStrategy,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use verify::Verifier;

/// How the classifier labelled the mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Status,
    Region,
    Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Synonym,
    CacheMatch,
    DirectProbe,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub column: String,
    pub value: EntityValue,
    #[serde(rename = "matchCount")]
    pub match_count: i64,
    pub tier: Tier,
}

impl ResolvedEntity {
    /// List values compile to `IN`, single values to `LIKE %value%`.
    pub fn to_filter(&self) -> Filter {
        match &self.value {
            EntityValue::Single(value) => Filter::Contains {
                column: self.column.clone(),
                value: value.clone(),
            },
            EntityValue::Many(values) => Filter::In {
                column: self.column.clone(),
                values: values.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedEntity),
    Ambiguous(Disambiguation),
    NoMatch,
}

/// One term travelling through the cascade. The direct probe runs at most once
/// per request and is shared by the disambiguation gate and tier 2.
pub struct ResolutionRequest {
    pub term: String,
    pub kind: EntityKind,
    /// Column suggested by the argument name, if any.
    pub hint: Option<String>,
    probe: OnceCell<Vec<ColumnCount>>,
}

impl ResolutionRequest {
    pub fn new(term: impl Into<String>, kind: EntityKind, hint: Option<String>) -> Self {
        Self {
            term: term.into().trim().to_string(),
            kind,
            hint,
            probe: OnceCell::new(),
        }
    }

    pub async fn probe_counts(&self, verifier: &Verifier, columns: &[String]) -> &[ColumnCount] {
        self.probe
            .get_or_init(|| verifier.probe(columns, &self.term))
            .await
    }
}

pub struct EntityResolver {
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    index: Arc<ColumnValueIndex>,
    verifier: Verifier,
}

impl EntityResolver {
    pub fn new(
        config: &EngineConfig,
        index: Arc<ColumnValueIndex>,
        synonyms: Arc<SynonymTables>,
        detector: Arc<DisambiguationDetector>,
        verifier: Verifier,
    ) -> Self {
        let columns = &config.columns;
        let strategies: Vec<Box<dyn ResolutionStrategy>> = vec![
            Box::new(SynonymStrategy::new(
                EntityKind::Status,
                columns.status.clone(),
                Arc::clone(&synonyms),
                verifier.clone(),
            )),
            Box::new(SynonymStrategy::new(
                EntityKind::Region,
                columns.region.clone(),
                Arc::clone(&synonyms),
                verifier.clone(),
            )),
            Box::new(ProjectTypeSynonymStrategy::new(
                columns.project_type.clone(),
                Arc::clone(&index),
                verifier.clone(),
            )),
            Box::new(DisambiguationGate::new(
                columns.probe_priority.clone(),
                detector,
                verifier.clone(),
            )),
            Box::new(CacheMatchStrategy::new(
                columns.cache_priority.clone(),
                columns.status.clone(),
                columns.region.clone(),
                Arc::clone(&index),
                verifier.clone(),
            )),
            Box::new(DirectProbeStrategy::new(
                columns.probe_priority.clone(),
                verifier.clone(),
            )),
        ];
        Self {
            strategies,
            index,
            verifier,
        }
    }

    /// Strategy names in cascade order.
    pub fn cascade(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn resolve(&self, request: ResolutionRequest) -> Resolution {
        if request.term.is_empty() {
            return Resolution::NoMatch;
        }
        for strategy in self.strategies.iter().filter(|s| s.applies_to(&request)) {
            match strategy.attempt(&request).await {
                StrategyOutcome::Hit(entity) => {
                    info!(
                        term = %request.term,
                        strategy = strategy.name(),
                        column = %entity.column,
                        count = entity.match_count,
                        "Entity resolved"
                    );
                    return Resolution::Resolved(entity);
                }
                StrategyOutcome::Ambiguous(choice) => {
                    info!(term = %request.term, options = choice.options.len(), "Entity is ambiguous");
                    return Resolution::Ambiguous(choice);
                }
                StrategyOutcome::Miss => {
                    debug!(term = %request.term, strategy = strategy.name(), "Tier miss");
                }
            }
        }
        Resolution::NoMatch
    }

    pub async fn resolve_term(&self, term: &str, kind: EntityKind) -> Resolution {
        self.resolve(ResolutionRequest::new(term, kind, None)).await
    }

    /// Resolves a term in a column the user picked from a disambiguation prompt.
    pub async fn resolve_in_column(&self, term: &str, column: &str) -> Resolution {
        let value = self
            .index
            .snapshot(column)
            .and_then(|snapshot| snapshot.exact(term).cloned())
            .unwrap_or_else(|| term.trim().to_string());
        match self.verifier.count_contains(column, &value).await {
            Ok(count) if count > 0 => Resolution::Resolved(ResolvedEntity {
                column: column.to_string(),
                value: EntityValue::Single(value),
                match_count: count,
                tier: Tier::Explicit,
            }),
            Ok(_) => Resolution::NoMatch,
            Err(e) => {
                tracing::warn!("Explicit column verification failed: {}", e);
                Resolution::NoMatch
            }
        }
    }
}
