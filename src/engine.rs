//! Query Engine
//!
//! Runs one question end to end:
//! guards → context → classifier → entity resolution → plan → execute → response.
//! `handle` never fails; every error becomes a `QueryResponse::Error`.

use crate::classifier::{
    ArgumentKind, ClassificationQueue, ClassificationRequest, DisabledClassifier, LlmClassifier,
    LlmClient, LlmNarrator, Narrator, QueryClassifier, QueryTemplate, TemplateCatalog,
    TemplateNarrator, TemplateRetriever,
};
use crate::config::EngineConfig;
use crate::context::{ContextChain, QueryContext, TurnContext};
use crate::db::{DataSource, PgDataSource};
use crate::disambiguation::{parse_markers, DisambiguationDetector, FilterMarker};
use crate::error::{EngineError, ErrorKind, Result};
use crate::guards;
use crate::index::{ColumnValueIndex, RefreshReport};
use crate::query::plan::{Filter, Projection, QueryPlan, Row};
use crate::query::{QueryBuilder, QueryExecutor};
use crate::resolver::verify::Verifier;
use crate::resolver::{EntityKind, EntityResolver, Resolution, ResolutionRequest};
use crate::response::{
    chart_for, suggestions_for_empty, suggestions_for_unmatched, QueryResponse, Summary, TabularResult,
};
use crate::synonyms::SynonymTables;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const NARRATIVE_SAMPLE_ROWS: u32 = 5;
const SUGGESTION_CANDIDATES: usize = 5;

/// Incoming question plus the chain the caller got back last time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub previous_context: Option<QueryContext>,
    #[serde(default)]
    pub original_context: Option<QueryContext>,
    #[serde(default)]
    pub follow_up: bool,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    /// Continues from a chain returned by an earlier answer.
    pub fn following(question: impl Into<String>, chain: &ContextChain) -> Self {
        Self {
            question: question.into(),
            previous_context: chain.previous.clone(),
            original_context: chain.original.clone(),
            follow_up: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub request_id: Uuid,
    pub response: QueryResponse,
    /// Present only when the turn produced a new chain.
    pub next_context: Option<ContextChain>,
}

impl EngineOutcome {
    pub fn to_api_json(&self) -> Value {
        self.response.to_api_json(self.next_context.as_ref())
    }
}

pub struct QueryEngine {
    config: Arc<EngineConfig>,
    index: Arc<ColumnValueIndex>,
    executor: Arc<QueryExecutor>,
    resolver: EntityResolver,
    builder: QueryBuilder,
    catalog: Arc<TemplateCatalog>,
    classifier: Arc<dyn QueryClassifier>,
    queue: ClassificationQueue,
    narrator: Arc<dyn Narrator>,
    retriever: Option<Arc<dyn TemplateRetriever>>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    source: Arc<dyn DataSource>,
    classifier: Arc<dyn QueryClassifier>,
    index: Option<Arc<ColumnValueIndex>>,
    catalog: Option<Arc<TemplateCatalog>>,
    narrator: Option<Arc<dyn Narrator>>,
    retriever: Option<Arc<dyn TemplateRetriever>>,
    synonyms: Option<SynonymTables>,
}

impl EngineBuilder {
    pub fn index(mut self, index: Arc<ColumnValueIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn catalog(mut self, catalog: Arc<TemplateCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn retriever(mut self, retriever: Arc<dyn TemplateRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn synonyms(mut self, synonyms: SynonymTables) -> Self {
        self.synonyms = Some(synonyms);
        self
    }

    pub fn build(self) -> QueryEngine {
        let config = Arc::new(self.config);
        let executor = Arc::new(QueryExecutor::new(self.source, config.retry.clone()));
        let builder = QueryBuilder::new(Arc::clone(&config));
        let index = self.index.unwrap_or_else(|| {
            Arc::new(ColumnValueIndex::new(
                config.table.clone(),
                config.columns.searchable.clone(),
                config.refresh_interval(),
            ))
        });
        let verifier = Verifier::new(Arc::clone(&executor), config.table.clone(), builder.like());
        let resolver = EntityResolver::new(
            &config,
            Arc::clone(&index),
            Arc::new(self.synonyms.unwrap_or_default()),
            Arc::new(DisambiguationDetector::new(config.disambiguation.clone())),
            verifier,
        );
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(TemplateCatalog::standard(&config)));

        QueryEngine {
            queue: ClassificationQueue::new(&config.queue),
            narrator: self.narrator.unwrap_or_else(|| Arc::new(TemplateNarrator)),
            retriever: self.retriever,
            classifier: self.classifier,
            config,
            index,
            executor,
            resolver,
            builder,
            catalog,
        }
    }
}

impl QueryEngine {
    pub fn builder(
        config: EngineConfig,
        source: Arc<dyn DataSource>,
        classifier: Arc<dyn QueryClassifier>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            source,
            classifier,
            index: None,
            catalog: None,
            narrator: None,
            retriever: None,
            synonyms: None,
        }
    }

    /// Wires the LLM classifier and narrator from config. Without an API key
    /// the engine still resolves and refreshes but cannot classify.
    pub fn with_llm(config: EngineConfig, source: Arc<dyn DataSource>) -> Self {
        let catalog = Arc::new(TemplateCatalog::standard(&config));
        match LlmClient::from_config(&config.llm) {
            Ok(client) => {
                info!("Using LLM classifier ({})", client.model());
                let classifier = Arc::new(LlmClassifier::new(client.clone(), Arc::clone(&catalog)));
                Self::builder(config, source, classifier)
                    .catalog(catalog)
                    .narrator(Arc::new(LlmNarrator::new(client)))
                    .build()
            }
            Err(e) => {
                warn!("LLM not configured, questions cannot be classified: {}", e);
                Self::builder(config, source, Arc::new(DisabledClassifier))
                    .catalog(catalog)
                    .build()
            }
        }
    }

    /// Connects to Postgres using `database_url`.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let url = config
            .database_url
            .clone()
            .ok_or_else(|| EngineError::Config("DATABASE_URL is not set".to_string()))?;
        let source = PgDataSource::connect(&url, config.pool_max_connections).await?;
        info!("Connected to Postgres (pool size {})", config.pool_max_connections);
        Ok(Self::with_llm(config, Arc::new(source)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<ColumnValueIndex> {
        &self.index
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub async fn refresh_index(&self) -> RefreshReport {
        self.index.refresh(Arc::clone(&self.executor), self.builder.like()).await
    }

    /// Loads the index if any column has never been loaded.
    pub async fn ensure_index(&self) -> Option<RefreshReport> {
        if self.index.is_initialized() {
            return None;
        }
        Some(self.refresh_index().await)
    }

    pub fn spawn_refresh_loop(&self, tick: Duration) -> JoinHandle<()> {
        Arc::clone(&self.index).spawn_refresh_loop(Arc::clone(&self.executor), self.builder.like(), tick)
    }

    /// Resolves one term outside a question.
    pub async fn resolve(&self, term: &str, kind: EntityKind) -> Resolution {
        self.ensure_index().await;
        self.resolver.resolve_term(term, kind).await
    }

    pub async fn handle_with_timeout(&self, request: QueryRequest) -> EngineOutcome {
        let timeout = self.config.request_timeout();
        let request_id = Uuid::new_v4();
        match tokio::time::timeout(timeout, self.handle_as(request_id, request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = EngineError::Timeout(timeout.as_millis() as u64);
                warn!(%request_id, "{}", error);
                EngineOutcome {
                    request_id,
                    response: QueryResponse::from_error(&error),
                    next_context: None,
                }
            }
        }
    }

    pub async fn handle(&self, request: QueryRequest) -> EngineOutcome {
        self.handle_as(Uuid::new_v4(), request).await
    }

    async fn handle_as(&self, request_id: Uuid, request: QueryRequest) -> EngineOutcome {
        info!(%request_id, question = %request.question, "Handling question");
        match self.run(&request).await {
            Ok((response, next_context)) => {
                info!(%request_id, variant = response.variant(), "Question answered");
                EngineOutcome {
                    request_id,
                    response,
                    next_context,
                }
            }
            Err(e) => {
                if e.kind() == ErrorKind::InternalError {
                    error!(%request_id, "Question failed: {}", e);
                } else {
                    info!(%request_id, kind = e.kind().as_str(), "Question rejected: {}", e);
                }
                EngineOutcome {
                    request_id,
                    response: QueryResponse::from_error(&e),
                    next_context: None,
                }
            }
        }
    }

    async fn run(&self, request: &QueryRequest) -> Result<(QueryResponse, Option<ContextChain>)> {
        guards::check_question(&request.question, self.config.max_question_length)?;
        let (question, markers) = parse_markers(&request.question);
        if question.is_empty() {
            return Err(EngineError::InvalidRequest("question is empty".to_string()));
        }

        let chain = ContextChain::new(request.previous_context.clone(), request.original_context.clone());
        let turn = chain.begin_turn(&question, request.follow_up, self.config.follow_up_limit)?;

        let classification_request = ClassificationRequest {
            question: question.clone(),
            previous: turn.previous.clone(),
            original: turn.original.clone(),
            candidate_templates: self.candidate_templates(&question).await,
        };
        let classifier = Arc::clone(&self.classifier);
        let classified = self
            .queue
            .run(async move { classifier.classify(&classification_request).await })
            .await
            .and_then(|raw| self.catalog.validate(&raw));
        let classification = match classified {
            Ok(classification) => classification,
            Err(EngineError::MalformedClassification(reason)) => {
                return self.narrative(&question, &turn, &reason).await;
            }
            Err(e) => return Err(e),
        };
        let template = self.catalog.get(&classification.template_name).ok_or_else(|| {
            EngineError::MalformedClassification(classification.template_name.clone())
        })?;
        let arguments = if turn.is_follow_up() {
            turn.merge_arguments(template, &classification.raw_arguments)
        } else {
            classification.raw_arguments.clone()
        };
        debug!(template = %template.name, ?arguments, "Classified");

        self.ensure_index().await;

        let mut choices = turn.carried_markers();
        for marker in markers {
            choices.retain(|m| !m.term.eq_ignore_ascii_case(&marker.term));
            choices.push(marker);
        }

        let mut filters = match self.resolve_arguments(template, &arguments, &choices).await? {
            Resolved::Filters(filters) => filters,
            Resolved::Stop(response) => return Ok((response, None)),
        };
        if turn.is_follow_up() {
            filters.extend(turn.same_noun_filters(&question, &self.config.columns));
        }

        let plan = match self.builder.build(template, &arguments, filters) {
            Ok(plan) => plan,
            Err(EngineError::MalformedClassification(reason)) => {
                return self.narrative(&question, &turn, &reason).await;
            }
            Err(e) => return Err(e),
        };
        let query = plan.compile(self.builder.like());
        let rows = self.executor.execute(&query).await?;

        if rows.is_empty() {
            return Ok((
                QueryResponse::Suggestions {
                    reason: "No projects matched all of the filters".to_string(),
                    alternatives: suggestions_for_empty(&arguments),
                },
                None,
            ));
        }

        let cols = &self.config.columns;
        let next = turn.commit(
            request.question.trim(),
            &template.name,
            arguments.clone(),
            &rows,
            self.config.context_row_limit,
        );
        let result = TabularResult {
            summary: Summary::from_rows(&rows, &cols.fee, &cols.status),
            chart: chart_for(&plan),
            rows,
            query,
            template: template.name.clone(),
            arguments,
        };
        Ok((QueryResponse::Tabular(result), Some(next)))
    }

    async fn candidate_templates(&self, question: &str) -> Vec<String> {
        let all = self.catalog.names();
        let Some(retriever) = &self.retriever else {
            return all;
        };
        match retriever.shortlist(question, self.catalog.templates()).await {
            Ok(names) => {
                let known: Vec<String> = names
                    .into_iter()
                    .filter(|name| self.catalog.get(name).is_some())
                    .collect();
                if known.is_empty() {
                    all
                } else {
                    known
                }
            }
            Err(e) => {
                warn!("Template retrieval failed, offering every template: {}", e);
                all
            }
        }
    }

    /// Resolves every entity argument. Stops at the first ambiguity or miss.
    async fn resolve_arguments(
        &self,
        template: &QueryTemplate,
        arguments: &Map<String, Value>,
        choices: &[FilterMarker],
    ) -> Result<Resolved> {
        let mut filters: Vec<Filter> = Vec::new();
        for spec in &template.arguments {
            let ArgumentKind::Entity { entity, hint } = &spec.kind else {
                continue;
            };
            let Some(term) = arguments.get(&spec.name).and_then(|v| v.as_str()) else {
                continue;
            };
            let choice = choices
                .iter()
                .find(|m| m.term.eq_ignore_ascii_case(term.trim()));
            let resolution = match choice {
                Some(marker) => {
                    let column = self.config.columns.canonical(&marker.column).ok_or_else(|| {
                        EngineError::InvalidRequest(format!("unknown column '{}' in filter marker", marker.column))
                    })?;
                    self.resolver.resolve_in_column(term, &column).await
                }
                None => {
                    self.resolver
                        .resolve(ResolutionRequest::new(term, *entity, hint.clone()))
                        .await
                }
            };
            match resolution {
                Resolution::Resolved(entity) => filters.push(entity.to_filter()),
                Resolution::Ambiguous(choice) => {
                    return Ok(Resolved::Stop(QueryResponse::Disambiguation(choice)));
                }
                Resolution::NoMatch => {
                    let similar = self.index.similar_values(term, SUGGESTION_CANDIDATES);
                    return Ok(Resolved::Stop(QueryResponse::Suggestions {
                        reason: format!("No projects matched \"{}\"", term.trim()),
                        alternatives: suggestions_for_unmatched(term, &similar),
                    }));
                }
            }
        }
        Ok(Resolved::Filters(filters))
    }

    async fn narrative(
        &self,
        question: &str,
        turn: &TurnContext,
        reason: &str,
    ) -> Result<(QueryResponse, Option<ContextChain>)> {
        warn!("Classifier output unusable, answering with a narrative: {}", reason);
        let samples = match turn.previous.as_ref().and_then(|p| p.result_rows.clone()) {
            Some(rows) if !rows.is_empty() => rows.into_iter().take(NARRATIVE_SAMPLE_ROWS as usize).collect(),
            _ => self.sample_rows().await,
        };
        let text = match self.narrator.narrate(question, &samples).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Narrator failed, using template narrative: {}", e);
                TemplateNarrator.narrate(question, &samples).await?
            }
        };
        Ok((
            QueryResponse::NarrativeFallback { text, samples },
            turn.commit_narrative(),
        ))
    }

    async fn sample_rows(&self) -> Vec<Row> {
        let plan = QueryPlan::new(
            &self.config.table,
            Projection::Columns(self.config.columns.result_columns.clone()),
        )
        .limit(NARRATIVE_SAMPLE_ROWS);
        match self.executor.execute(&plan.compile(self.builder.like())).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Could not load sample rows: {}", e);
                Vec::new()
            }
        }
    }
}

enum Resolved {
    Filters(Vec<Filter>),
    Stop(QueryResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, ClassificationRequest, ScriptedClassifier};
    use crate::db::MemoryDataSource;
    use async_trait::async_trait;
    use serde_json::json;

    fn engine(classifier: Arc<ScriptedClassifier>) -> QueryEngine {
        let rows: Vec<Row> = serde_json::from_value(json!([
            {"ProjectName": "Route 9 Bridge", "Client": "NYSDOT", "Company": "LiRo Engineers", "Status": "Active", "Region": "Northeast", "Fee": 1200000},
            {"ProjectName": "Dubai Metro", "Client": "RTA", "Company": "Acme Design", "Status": "Won", "Region": "MENA", "Fee": 800000}
        ]))
        .unwrap();
        QueryEngine::builder(
            EngineConfig::default(),
            Arc::new(MemoryDataSource::new(rows).unwrap()),
            classifier,
        )
        .build()
    }

    #[tokio::test]
    async fn test_guard_runs_before_classifier() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let engine = engine(Arc::clone(&classifier));
        let outcome = engine.handle(QueryRequest::new("DROP TABLE projects")).await;
        assert!(matches!(
            outcome.response,
            QueryResponse::Error {
                kind: ErrorKind::RestrictedOperation,
                ..
            }
        ));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_tabular_answer_builds_root_chain() {
        let classifier = Arc::new(
            ScriptedClassifier::new().then(Classification::new("search_projects", json!({"entity": "LiRo"}))),
        );
        let engine = engine(Arc::clone(&classifier));
        let outcome = engine.handle(QueryRequest::new("show LiRo projects")).await;
        let QueryResponse::Tabular(result) = &outcome.response else {
            panic!("expected table, got {:?}", outcome.response);
        };
        assert_eq!(result.rows.len(), 1);
        let chain = outcome.next_context.unwrap();
        assert_eq!(chain.previous, chain.original);
        assert_eq!(chain.original.unwrap().depth, 0);
    }

    #[tokio::test]
    async fn test_classifier_error_keeps_no_context() {
        let classifier = Arc::new(ScriptedClassifier::new().then_err(EngineError::RateLimited("busy".into())));
        let engine = engine(classifier);
        let outcome = engine.handle(QueryRequest::new("show open projects")).await;
        assert_eq!(outcome.response.status_code(), 429);
        assert!(outcome.next_context.is_none());
    }

    struct StalledClassifier;

    #[async_trait]
    impl QueryClassifier for StalledClassifier {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn classify(&self, _request: &ClassificationRequest) -> Result<Classification> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Classification::new("search_projects", json!({"status": "open"})))
        }
    }

    #[tokio::test]
    async fn test_timed_out_request_commits_nothing_and_frees_its_slot() {
        let config = EngineConfig {
            request_timeout_ms: 20,
            ..EngineConfig::default()
        };
        let engine = QueryEngine::builder(
            config,
            Arc::new(MemoryDataSource::new(Vec::new()).unwrap()),
            Arc::new(StalledClassifier),
        )
        .build();

        let outcome = engine.handle_with_timeout(QueryRequest::new("show open projects")).await;

        assert!(matches!(
            outcome.response,
            QueryResponse::Error {
                kind: ErrorKind::InternalError,
                ..
            }
        ));
        assert!(outcome.next_context.is_none());
        assert_eq!(engine.queue.available(), engine.queue.workers());
    }
}
