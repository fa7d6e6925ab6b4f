//! Query Plan
//!
//! Structured form of every query the engine issues. A plan compiles to SQL
//! with named `@pN` placeholders; literal values never appear in the text.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Date(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Gte,
    Lte,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gte => ">=",
            CompareOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// `column IN (...)` over canonical values.
    In { column: String, values: Vec<String> },
    /// `column LIKE %value%`.
    Contains { column: String, value: String },
    Compare {
        column: String,
        op: CompareOp,
        value: ParamValue,
    },
    /// `column IS NOT NULL AND column <> ''`.
    NotBlank { column: String },
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::In { column, .. }
            | Filter::Contains { column, .. }
            | Filter::Compare { column, .. }
            | Filter::NotBlank { column } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    Columns(Vec<String>),
    Count,
    Distinct(String),
    /// `column, COUNT(*) AS count ... GROUP BY column`
    GroupCount { column: String },
    /// `column, SUM(measure) AS total, COUNT(*) AS count ... GROUP BY column`
    GroupSum { column: String, measure: String },
}

pub const COUNT_ALIAS: &str = "count";
pub const TOTAL_ALIAS: &str = "total";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub table: String,
    pub projection: Projection,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u32>,
}

impl QueryPlan {
    pub fn new(table: impl Into<String>, projection: Projection) -> Self {
        Self {
            table: table.into(),
            projection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Renders the plan. `like` is the substring keyword (`LIKE` or `ILIKE`).
    pub fn compile(&self, like: &str) -> ParameterizedQuery {
        let mut params: Vec<(String, ParamValue)> = Vec::new();
        let mut bind = |value: ParamValue| {
            let name = format!("@p{}", params.len() + 1);
            params.push((name.clone(), value));
            name
        };

        let select = match &self.projection {
            Projection::Columns(cols) if cols.is_empty() => "*".to_string(),
            Projection::Columns(cols) => cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            Projection::Count => format!("COUNT(*) AS {}", quote_ident(COUNT_ALIAS)),
            Projection::Distinct(col) => format!("DISTINCT {}", quote_ident(col)),
            Projection::GroupCount { column } => {
                format!("{}, COUNT(*) AS {}", quote_ident(column), quote_ident(COUNT_ALIAS))
            }
            Projection::GroupSum { column, measure } => format!(
                "{}, SUM({}) AS {}, COUNT(*) AS {}",
                quote_ident(column),
                quote_ident(measure),
                quote_ident(TOTAL_ALIAS),
                quote_ident(COUNT_ALIAS)
            ),
        };

        let mut sql = format!("SELECT {} FROM {}", select, quote_ident(&self.table));

        let conditions: Vec<String> = self
            .filters
            .iter()
            .map(|filter| match filter {
                Filter::In { column, values } => {
                    let names: Vec<String> = values
                        .iter()
                        .map(|v| bind(ParamValue::Text(v.clone())))
                        .collect();
                    format!("{} IN ({})", quote_ident(column), names.join(", "))
                }
                Filter::Contains { column, value } => {
                    let name = bind(ParamValue::Text(format!("%{}%", value)));
                    format!("{} {} {}", quote_ident(column), like, name)
                }
                Filter::Compare { column, op, value } => {
                    let name = bind(value.clone());
                    format!("{} {} {}", quote_ident(column), op.sql(), name)
                }
                Filter::NotBlank { column } => {
                    let col = quote_ident(column);
                    format!("{} IS NOT NULL AND {} <> ''", col, col)
                }
            })
            .collect();

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        match &self.projection {
            Projection::GroupCount { column } | Projection::GroupSum { column, .. } => {
                sql.push_str(&format!(" GROUP BY {}", quote_ident(column)));
            }
            _ => {}
        }

        if let Some(order) = &self.order_by {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                quote_ident(&order.column),
                if order.descending { "DESC" } else { "ASC" }
            ));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        ParameterizedQuery {
            sql,
            params,
            plan: self.clone(),
        }
    }
}

/// Compiled query: SQL text, bound parameters, and the plan it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterizedQuery {
    pub sql: String,
    pub params: Vec<(String, ParamValue)>,
    #[serde(skip)]
    pub plan: QueryPlan,
}

impl ParameterizedQuery {
    /// Parameters as a `{"@p1": value}` object for the response payload.
    pub fn params_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_and_like_use_placeholders() {
        let query = QueryPlan::new("projects", Projection::Columns(vec!["ProjectName".into()]))
            .filter(Filter::In {
                column: "Status".into(),
                values: vec!["Active".into(), "Pending".into()],
            })
            .filter(Filter::Contains {
                column: "Client".into(),
                value: "O'Brien".into(),
            })
            .limit(50)
            .compile("LIKE");

        assert_eq!(
            query.sql,
            "SELECT \"ProjectName\" FROM \"projects\" WHERE \"Status\" IN (@p1, @p2) AND \"Client\" LIKE @p3 LIMIT 50"
        );
        assert_eq!(query.params.len(), 3);
        assert_eq!(query.params[2].1, ParamValue::Text("%O'Brien%".into()));
        assert!(!query.sql.contains("O'Brien"));
    }

    #[test]
    fn test_group_sum_ordering() {
        let query = QueryPlan::new(
            "projects",
            Projection::GroupSum {
                column: "Client".into(),
                measure: "Fee".into(),
            },
        )
        .order_by(TOTAL_ALIAS, true)
        .limit(5)
        .compile("ILIKE");
        assert_eq!(
            query.sql,
            "SELECT \"Client\", SUM(\"Fee\") AS \"total\", COUNT(*) AS \"count\" FROM \"projects\" GROUP BY \"Client\" ORDER BY \"total\" DESC LIMIT 5"
        );
    }

    #[test]
    fn test_distinct_not_blank() {
        let query = QueryPlan::new("projects", Projection::Distinct("Region".into()))
            .filter(Filter::NotBlank { column: "Region".into() })
            .compile("LIKE");
        assert_eq!(
            query.sql,
            "SELECT DISTINCT \"Region\" FROM \"projects\" WHERE \"Region\" IS NOT NULL AND \"Region\" <> ''"
        );
        assert!(query.params.is_empty());
    }

    #[test]
    fn test_identifier_quoting_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
