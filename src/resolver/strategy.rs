//! Resolution strategies
//!
//! Each tier of the cascade is one strategy. The resolver walks them in order
//! and stops at the first outcome that is not a miss.

use super::verify::Verifier;
use super::{EntityKind, EntityValue, ResolutionRequest, ResolvedEntity, Tier};
use crate::disambiguation::{Disambiguation, DisambiguationDetector};
use crate::index::ColumnValueIndex;
use crate::synonyms::{ProjectTypeSynonyms, SynonymTables};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub enum StrategyOutcome {
    Hit(ResolvedEntity),
    Ambiguous(Disambiguation),
    Miss,
}

#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, request: &ResolutionRequest) -> bool;

    async fn attempt(&self, request: &ResolutionRequest) -> StrategyOutcome;
}

/// Verified entity or a miss when the count is zero or the query failed.
async fn verified_contains(verifier: &Verifier, column: &str, value: &str, tier: Tier) -> StrategyOutcome {
    match verifier.count_contains(column, value).await {
        Ok(count) if count > 0 => StrategyOutcome::Hit(ResolvedEntity {
            column: column.to_string(),
            value: EntityValue::Single(value.to_string()),
            match_count: count,
            tier,
        }),
        Ok(_) => {
            debug!("'{}' in {} verified to zero rows", value, column);
            StrategyOutcome::Miss
        }
        Err(e) => {
            warn!("Verification of '{}' in {} failed: {}", value, column, e);
            StrategyOutcome::Miss
        }
    }
}

/// Static status groups or region aliases, applied as `IN (...)`.
pub struct SynonymStrategy {
    kind: EntityKind,
    column: String,
    tables: Arc<SynonymTables>,
    verifier: Verifier,
}

impl SynonymStrategy {
    pub fn new(kind: EntityKind, column: String, tables: Arc<SynonymTables>, verifier: Verifier) -> Self {
        Self {
            kind,
            column,
            tables,
            verifier,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for SynonymStrategy {
    fn name(&self) -> &'static str {
        match self.kind {
            EntityKind::Status => "status_synonym",
            _ => "region_synonym",
        }
    }

    fn applies_to(&self, request: &ResolutionRequest) -> bool {
        request.kind == self.kind
    }

    async fn attempt(&self, request: &ResolutionRequest) -> StrategyOutcome {
        let values = match self.kind {
            EntityKind::Status => self.tables.resolve_status(&request.term),
            EntityKind::Region => self.tables.resolve_region(&request.term),
            EntityKind::Entity => None,
        };
        let Some(values) = values else {
            return StrategyOutcome::Miss;
        };
        match self.verifier.count_in(&self.column, &values).await {
            Ok(count) if count > 0 => StrategyOutcome::Hit(ResolvedEntity {
                column: self.column.clone(),
                value: EntityValue::Many(values),
                match_count: count,
                tier: Tier::Synonym,
            }),
            Ok(_) => StrategyOutcome::Miss,
            Err(e) => {
                warn!("Synonym verification for '{}' failed: {}", request.term, e);
                StrategyOutcome::Miss
            }
        }
    }
}

/// Aliases derived from the project-type column, used when the classifier
/// labelled the mention as a project type.
pub struct ProjectTypeSynonymStrategy {
    column: String,
    index: Arc<ColumnValueIndex>,
    verifier: Verifier,
}

impl ProjectTypeSynonymStrategy {
    pub fn new(column: String, index: Arc<ColumnValueIndex>, verifier: Verifier) -> Self {
        Self {
            column,
            index,
            verifier,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for ProjectTypeSynonymStrategy {
    fn name(&self) -> &'static str {
        "project_type_synonym"
    }

    fn applies_to(&self, request: &ResolutionRequest) -> bool {
        request.kind == EntityKind::Entity && request.hint.as_deref() == Some(self.column.as_str())
    }

    async fn attempt(&self, request: &ResolutionRequest) -> StrategyOutcome {
        let Some(snapshot) = self.index.snapshot(&self.column) else {
            return StrategyOutcome::Miss;
        };
        match ProjectTypeSynonyms::of(&snapshot).resolve(&request.term) {
            Some(canonical) => {
                verified_contains(&self.verifier, &self.column, canonical, Tier::Synonym).await
            }
            None => StrategyOutcome::Miss,
        }
    }
}

/// Asks the user when the direct probe finds the term in several columns.
pub struct DisambiguationGate {
    probe_columns: Vec<String>,
    detector: Arc<DisambiguationDetector>,
    verifier: Verifier,
}

impl DisambiguationGate {
    pub fn new(probe_columns: Vec<String>, detector: Arc<DisambiguationDetector>, verifier: Verifier) -> Self {
        Self {
            probe_columns,
            detector,
            verifier,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for DisambiguationGate {
    fn name(&self) -> &'static str {
        "disambiguation"
    }

    fn applies_to(&self, request: &ResolutionRequest) -> bool {
        request.kind == EntityKind::Entity
    }

    async fn attempt(&self, request: &ResolutionRequest) -> StrategyOutcome {
        let counts = request.probe_counts(&self.verifier, &self.probe_columns).await;
        match self.detector.detect(&request.term, counts) {
            Some(choice) => StrategyOutcome::Ambiguous(choice),
            None => StrategyOutcome::Miss,
        }
    }
}

/// Tier 1: exact then substring search-term match, columns in priority order.
pub struct CacheMatchStrategy {
    entity_columns: Vec<String>,
    status_column: String,
    region_column: String,
    index: Arc<ColumnValueIndex>,
    verifier: Verifier,
}

impl CacheMatchStrategy {
    pub fn new(
        entity_columns: Vec<String>,
        status_column: String,
        region_column: String,
        index: Arc<ColumnValueIndex>,
        verifier: Verifier,
    ) -> Self {
        Self {
            entity_columns,
            status_column,
            region_column,
            index,
            verifier,
        }
    }

    fn columns_for(&self, kind: EntityKind) -> Vec<&String> {
        match kind {
            EntityKind::Status => vec![&self.status_column],
            EntityKind::Region => vec![&self.region_column],
            EntityKind::Entity => self.entity_columns.iter().collect(),
        }
    }

    /// First column (in priority order) whose snapshot matches the term.
    pub fn lookup(&self, kind: EntityKind, term: &str) -> Option<(String, String)> {
        for column in self.columns_for(kind) {
            let Some(snapshot) = self.index.snapshot(column) else {
                continue;
            };
            if let Some(value) = snapshot.exact(term).or_else(|| snapshot.substring(term)) {
                return Some((column.clone(), value.clone()));
            }
        }
        None
    }
}

#[async_trait]
impl ResolutionStrategy for CacheMatchStrategy {
    fn name(&self) -> &'static str {
        "cache_match"
    }

    fn applies_to(&self, _request: &ResolutionRequest) -> bool {
        true
    }

    async fn attempt(&self, request: &ResolutionRequest) -> StrategyOutcome {
        match self.lookup(request.kind, &request.term) {
            Some((column, value)) => {
                verified_contains(&self.verifier, &column, &value, Tier::CacheMatch).await
            }
            None => StrategyOutcome::Miss,
        }
    }
}

/// Tier 2: the column with the highest probe count; ties go to priority order.
pub struct DirectProbeStrategy {
    probe_columns: Vec<String>,
    verifier: Verifier,
}

impl DirectProbeStrategy {
    pub fn new(probe_columns: Vec<String>, verifier: Verifier) -> Self {
        Self {
            probe_columns,
            verifier,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for DirectProbeStrategy {
    fn name(&self) -> &'static str {
        "direct_probe"
    }

    fn applies_to(&self, request: &ResolutionRequest) -> bool {
        request.kind == EntityKind::Entity
    }

    async fn attempt(&self, request: &ResolutionRequest) -> StrategyOutcome {
        let counts = request.probe_counts(&self.verifier, &self.probe_columns).await;
        let mut best: Option<&crate::disambiguation::ColumnCount> = None;
        for candidate in counts.iter().filter(|c| c.count > 0) {
            if best.map(|b| candidate.count > b.count).unwrap_or(true) {
                best = Some(candidate);
            }
        }
        match best {
            Some(hit) => StrategyOutcome::Hit(ResolvedEntity {
                column: hit.column.clone(),
                value: EntityValue::Single(request.term.clone()),
                match_count: hit.count,
                tier: Tier::DirectProbe,
            }),
            None => StrategyOutcome::Miss,
        }
    }
}
