//! Query Builder
//!
//! Template + resolved arguments → `QueryPlan`. Entity filters arrive already
//! resolved; numeric, date, text and sort/limit arguments are parsed and
//! validated here. Anything the builder cannot interpret fails closed as a
//! malformed classification.

use crate::classifier::{ArgumentKind, QueryTemplate, TemplateShape};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::query::plan::{CompareOp, Filter, ParamValue, Projection, QueryPlan, COUNT_ALIAS, TOTAL_ALIAS};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_TOP_N: u32 = 10;
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

fn malformed(message: String) -> EngineError {
    EngineError::MalformedClassification(message)
}

#[derive(Clone)]
pub struct QueryBuilder {
    config: Arc<EngineConfig>,
}

#[derive(Default)]
struct Directives {
    group_by: Option<String>,
    sort_by: Option<String>,
    descending: Option<bool>,
    limit: Option<u32>,
}

impl QueryBuilder {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Substring keyword for this deployment.
    pub fn like(&self) -> &'static str {
        if self.config.case_insensitive_match {
            "ILIKE"
        } else {
            "LIKE"
        }
    }

    pub fn build(
        &self,
        template: &QueryTemplate,
        arguments: &Map<String, Value>,
        resolved: Vec<Filter>,
    ) -> Result<QueryPlan> {
        let cols = &self.config.columns;
        let mut filters = resolved;
        let mut directives = Directives::default();
        let mut has_text = false;

        for (name, value) in arguments {
            let spec = template.argument(name).ok_or_else(|| {
                malformed(format!("template '{}' has no argument '{}'", template.name, name))
            })?;
            match &spec.kind {
                ArgumentKind::Entity { .. } => {}
                ArgumentKind::Numeric { column, op } => filters.push(Filter::Compare {
                    column: column.clone(),
                    op: *op,
                    value: parse_number(name, value)?,
                }),
                ArgumentKind::Date { column, op } => filters.push(Filter::Compare {
                    column: column.clone(),
                    op: *op,
                    value: ParamValue::Date(parse_date(name, value)?),
                }),
                ArgumentKind::Text { column, exact } => {
                    let text = as_text(name, value)?;
                    has_text = true;
                    filters.push(if *exact {
                        Filter::Compare {
                            column: column.clone(),
                            op: CompareOp::Eq,
                            value: ParamValue::Text(text),
                        }
                    } else {
                        Filter::Contains {
                            column: column.clone(),
                            value: text,
                        }
                    });
                }
                ArgumentKind::GroupBy => directives.group_by = Some(self.column(name, value)?),
                ArgumentKind::SortBy => directives.sort_by = Some(self.column(name, value)?),
                ArgumentKind::SortOrder => directives.descending = Some(parse_order(value)?),
                ArgumentKind::Limit => directives.limit = Some(self.parse_limit(value)?),
            }
        }

        for filter in &filters {
            if !cols.is_known(filter.column()) {
                return Err(EngineError::QueryBuild(format!(
                    "column '{}' is not allowed",
                    filter.column()
                )));
            }
        }

        let table = &self.config.table;
        let plan = match template.shape {
            TemplateShape::Rows => {
                let mut plan = QueryPlan::new(table, Projection::Columns(cols.result_columns.clone()));
                plan.filters = filters;
                let sort = match (directives.sort_by, directives.descending) {
                    (Some(column), order) => {
                        let descending = order.unwrap_or(column == cols.fee || column == cols.start_date);
                        Some((column, descending))
                    }
                    (None, Some(descending)) => Some((cols.fee.clone(), descending)),
                    (None, None) => None,
                };
                if let Some((column, descending)) = sort {
                    plan = plan.order_by(column, descending);
                }
                plan.limit(directives.limit.unwrap_or(self.config.default_limit))
            }
            TemplateShape::Count => match directives.group_by {
                Some(column) => {
                    let mut plan = QueryPlan::new(table, Projection::GroupCount { column: column.clone() });
                    plan.filters = filters;
                    plan.filter(Filter::NotBlank { column })
                        .order_by(COUNT_ALIAS, true)
                        .limit(self.config.max_rows)
                }
                None => {
                    let mut plan = QueryPlan::new(table, Projection::Count);
                    plan.filters = filters;
                    plan
                }
            },
            TemplateShape::TopByFee => {
                let column = match directives.group_by {
                    Some(column) => column,
                    None => cols
                        .searchable
                        .first()
                        .cloned()
                        .ok_or_else(|| EngineError::Config("no searchable columns configured".to_string()))?,
                };
                let mut plan = QueryPlan::new(
                    table,
                    Projection::GroupSum {
                        column: column.clone(),
                        measure: cols.fee.clone(),
                    },
                );
                plan.filters = filters;
                plan.filter(Filter::NotBlank { column })
                    .order_by(TOTAL_ALIAS, true)
                    .limit(directives.limit.unwrap_or(DEFAULT_TOP_N))
            }
            TemplateShape::Details => {
                if !has_text {
                    return Err(malformed(
                        "project_details needs a project name or number".to_string(),
                    ));
                }
                let mut plan = QueryPlan::new(table, Projection::Columns(Vec::new()));
                plan.filters = filters;
                plan.limit(directives.limit.unwrap_or(self.config.default_limit))
            }
        };

        debug!(template = %template.name, filters = plan.filters.len(), "Plan built");
        Ok(plan)
    }

    fn column(&self, name: &str, value: &Value) -> Result<String> {
        let raw = as_text(name, value)?;
        self.config
            .columns
            .canonical(&raw)
            .or_else(|| {
                let fee = &self.config.columns.fee;
                let start = &self.config.columns.start_date;
                [fee, start]
                    .into_iter()
                    .find(|c| c.eq_ignore_ascii_case(raw.trim()))
                    .cloned()
            })
            .ok_or_else(|| malformed(format!("'{}' is not a known column for {}", raw, name)))
    }

    fn parse_limit(&self, value: &Value) -> Result<u32> {
        let limit = value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| malformed(format!("limit {} is not a positive integer", value)))?;
        if limit == 0 || limit > self.config.max_rows as u64 {
            return Err(malformed(format!(
                "limit {} is outside 1..={}",
                limit, self.config.max_rows
            )));
        }
        Ok(limit as u32)
    }
}

fn as_text(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed(format!("argument '{}' must be text, got {}", name, value)))
}

fn parse_number(name: &str, value: &Value) -> Result<ParamValue> {
    if let Some(i) = value.as_i64() {
        return Ok(ParamValue::Integer(i));
    }
    let number = value
        .as_f64()
        .or_else(|| {
            value
                .as_str()
                .map(|s| s.trim().replace([',', '$'], ""))
                .and_then(|s| s.parse().ok())
        })
        .ok_or_else(|| malformed(format!("argument '{}' must be a number, got {}", name, value)))?;
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Ok(ParamValue::Integer(number as i64))
    } else {
        Ok(ParamValue::Float(number))
    }
}

fn parse_date(name: &str, value: &Value) -> Result<NaiveDate> {
    let raw = as_text(name, value)?;
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&raw, format).ok())
        .ok_or_else(|| malformed(format!("argument '{}' is not a date: {}", name, raw)))
}

fn parse_order(value: &Value) -> Result<bool> {
    match value.as_str().map(|s| s.trim().to_lowercase()).as_deref() {
        Some("asc") | Some("ascending") => Ok(false),
        Some("desc") | Some("descending") => Ok(true),
        _ => Err(malformed(format!("sort order {} must be asc or desc", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::templates::{
        TemplateCatalog, COUNT_PROJECTS, PROJECT_DETAILS, SEARCH_PROJECTS, TOP_BY_FEE,
    };
    use serde_json::json;

    fn setup() -> (QueryBuilder, TemplateCatalog) {
        let config = EngineConfig::default();
        let catalog = TemplateCatalog::standard(&config);
        (QueryBuilder::new(Arc::new(config)), catalog)
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_search_with_fee_and_sort() {
        let (builder, catalog) = setup();
        let status = Filter::In {
            column: "Status".into(),
            values: vec!["Active".into(), "In Progress".into()],
        };
        let plan = builder
            .build(
                catalog.get(SEARCH_PROJECTS).unwrap(),
                &args(json!({"status": "active", "min_fee": "1,000,000", "sort_by": "fee", "limit": 5})),
                vec![status],
            )
            .unwrap();
        let query = plan.compile(builder.like());
        assert!(query.sql.contains("\"Status\" IN (@p1, @p2)"));
        assert!(query.sql.contains("\"Fee\" >= @p3"));
        assert!(query.sql.ends_with("ORDER BY \"Fee\" DESC LIMIT 5"));
        assert_eq!(query.params[2].1, ParamValue::Integer(1_000_000));
    }

    #[test]
    fn test_default_limit_applied() {
        let (builder, catalog) = setup();
        let plan = builder
            .build(catalog.get(SEARCH_PROJECTS).unwrap(), &Map::new(), vec![])
            .unwrap();
        assert_eq!(plan.limit, Some(100));
        assert!(plan.order_by.is_none());
    }

    #[test]
    fn test_top_by_fee_defaults_to_client() {
        let (builder, catalog) = setup();
        let plan = builder
            .build(catalog.get(TOP_BY_FEE).unwrap(), &args(json!({"limit": 3})), vec![])
            .unwrap();
        assert_eq!(
            plan.projection,
            Projection::GroupSum {
                column: "Client".into(),
                measure: "Fee".into()
            }
        );
        assert_eq!(plan.limit, Some(3));
        assert_eq!(plan.order_by.unwrap().column, TOTAL_ALIAS);
    }

    #[test]
    fn test_count_grouped_and_dates() {
        let (builder, catalog) = setup();
        let plan = builder
            .build(
                catalog.get(COUNT_PROJECTS).unwrap(),
                &args(json!({"group_by": "region", "start_after": "2023-01-01"})),
                vec![],
            )
            .unwrap();
        assert_eq!(plan.projection, Projection::GroupCount { column: "Region".into() });
        assert!(plan.filters.contains(&Filter::Compare {
            column: "StartDate".into(),
            op: CompareOp::Gte,
            value: ParamValue::Date(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()),
        }));
    }

    #[test]
    fn test_invalid_directives_are_malformed() {
        let (builder, catalog) = setup();
        let search = catalog.get(SEARCH_PROJECTS).unwrap();
        for bad in [
            json!({"limit": 0}),
            json!({"limit": 10_000}),
            json!({"sort_by": "password"}),
            json!({"sort_order": "sideways"}),
            json!({"start_after": "last tuesday"}),
        ] {
            let err = builder.build(search, &args(bad.clone()), vec![]).unwrap_err();
            assert!(matches!(err, EngineError::MalformedClassification(_)), "{}", bad);
        }
    }

    #[test]
    fn test_details_requires_identifier() {
        let (builder, catalog) = setup();
        let details = catalog.get(PROJECT_DETAILS).unwrap();
        assert!(builder.build(details, &Map::new(), vec![]).is_err());
        let plan = builder
            .build(details, &args(json!({"project_number": "P-1042"})), vec![])
            .unwrap();
        assert_eq!(plan.compile("LIKE").sql, "SELECT * FROM \"projects\" WHERE \"ProjectNumber\" = @p1 LIMIT 100");
    }

    #[test]
    fn test_unknown_filter_column_rejected() {
        let (builder, catalog) = setup();
        let err = builder
            .build(
                catalog.get(SEARCH_PROJECTS).unwrap(),
                &Map::new(),
                vec![Filter::Contains {
                    column: "Salary".into(),
                    value: "x".into(),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::QueryBuild(_)));
    }

    #[test]
    fn test_like_follows_config() {
        let (builder, _) = setup();
        assert_eq!(builder.like(), "ILIKE");
        let config = EngineConfig {
            case_insensitive_match: false,
            ..EngineConfig::default()
        };
        assert_eq!(QueryBuilder::new(Arc::new(config)).like(), "LIKE");
    }
}
