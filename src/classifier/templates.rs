//! Template catalog
//!
//! Named query templates the classifier may choose from. Each template lists
//! its arguments and their kinds; the catalog turns them into function
//! definitions for the LLM and checks the shape of whatever comes back.

use super::function_schema::FunctionDefinition;
use super::Classification;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::query::plan::CompareOp;
use crate::resolver::EntityKind;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const SEARCH_PROJECTS: &str = "search_projects";
pub const COUNT_PROJECTS: &str = "count_projects";
pub const TOP_BY_FEE: &str = "top_by_fee";
pub const PROJECT_DETAILS: &str = "project_details";

/// What the builder produces for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateShape {
    Rows,
    Count,
    TopByFee,
    Details,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ArgumentKind {
    /// Free-text mention resolved through the cascade. `hint` names the
    /// column the argument is about, if the template knows it.
    Entity {
        entity: EntityKind,
        hint: Option<String>,
    },
    Numeric {
        column: String,
        op: CompareOp,
    },
    Date {
        column: String,
        op: CompareOp,
    },
    /// Literal text matched without resolution.
    Text {
        column: String,
        exact: bool,
    },
    GroupBy,
    SortBy,
    SortOrder,
    Limit,
}

impl ArgumentKind {
    pub fn is_entity(&self) -> bool {
        matches!(self, ArgumentKind::Entity { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgumentSpec {
    pub name: String,
    pub description: String,
    pub kind: ArgumentKind,
}

impl ArgumentSpec {
    fn new(name: &str, description: &str, kind: ArgumentKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryTemplate {
    pub name: String,
    pub description: String,
    pub shape: TemplateShape,
    pub arguments: Vec<ArgumentSpec>,
}

impl QueryTemplate {
    pub fn argument(&self, name: &str) -> Option<&ArgumentSpec> {
        self.arguments.iter().find(|a| a.name == name)
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.argument(name).is_some()
    }
}

pub struct TemplateCatalog {
    templates: Vec<QueryTemplate>,
    groupable: Vec<String>,
    sortable: Vec<String>,
    max_rows: u32,
}

impl TemplateCatalog {
    /// The four templates of the projects dataset.
    pub fn standard(config: &EngineConfig) -> Self {
        let cols = &config.columns;
        let entity = || {
            ArgumentSpec::new(
                "entity",
                "Name of a client, company, city, division or other organisation, exactly as the user wrote it",
                ArgumentKind::Entity {
                    entity: EntityKind::Entity,
                    hint: None,
                },
            )
        };
        let status = || {
            ArgumentSpec::new(
                "status",
                "Project status as the user phrased it (e.g. 'open', 'won', 'on hold')",
                ArgumentKind::Entity {
                    entity: EntityKind::Status,
                    hint: Some(cols.status.clone()),
                },
            )
        };
        let region = || {
            ArgumentSpec::new(
                "region",
                "Region or country as the user phrased it (e.g. 'UAE', 'northeast')",
                ArgumentKind::Entity {
                    entity: EntityKind::Region,
                    hint: Some(cols.region.clone()),
                },
            )
        };
        let project_type = || {
            ArgumentSpec::new(
                "project_type",
                "Kind of project as the user phrased it (e.g. 'highway', 'rail')",
                ArgumentKind::Entity {
                    entity: EntityKind::Entity,
                    hint: Some(cols.project_type.clone()),
                },
            )
        };
        let date = |name: &str, description: &str, op: CompareOp| {
            ArgumentSpec::new(
                name,
                description,
                ArgumentKind::Date {
                    column: cols.start_date.clone(),
                    op,
                },
            )
        };
        let start_after = || date("start_after", "Only projects starting on or after this date (YYYY-MM-DD)", CompareOp::Gte);
        let start_before = || date("start_before", "Only projects starting on or before this date (YYYY-MM-DD)", CompareOp::Lte);
        let group_by = || ArgumentSpec::new("group_by", "Column to group results by", ArgumentKind::GroupBy);
        let limit = || ArgumentSpec::new("limit", "Maximum number of rows", ArgumentKind::Limit);

        let templates = vec![
            QueryTemplate {
                name: SEARCH_PROJECTS.to_string(),
                description: "List projects matching filters".to_string(),
                shape: TemplateShape::Rows,
                arguments: vec![
                    entity(),
                    status(),
                    region(),
                    project_type(),
                    ArgumentSpec::new(
                        "min_fee",
                        "Minimum fee",
                        ArgumentKind::Numeric {
                            column: cols.fee.clone(),
                            op: CompareOp::Gte,
                        },
                    ),
                    ArgumentSpec::new(
                        "max_fee",
                        "Maximum fee",
                        ArgumentKind::Numeric {
                            column: cols.fee.clone(),
                            op: CompareOp::Lte,
                        },
                    ),
                    start_after(),
                    start_before(),
                    ArgumentSpec::new("sort_by", "Column to sort by", ArgumentKind::SortBy),
                    ArgumentSpec::new("sort_order", "asc or desc", ArgumentKind::SortOrder),
                    limit(),
                ],
            },
            QueryTemplate {
                name: COUNT_PROJECTS.to_string(),
                description: "Count projects matching filters, optionally grouped by a column".to_string(),
                shape: TemplateShape::Count,
                arguments: vec![
                    entity(),
                    status(),
                    region(),
                    project_type(),
                    start_after(),
                    start_before(),
                    group_by(),
                ],
            },
            QueryTemplate {
                name: TOP_BY_FEE.to_string(),
                description: "Rank clients (or another column) by total fee".to_string(),
                shape: TemplateShape::TopByFee,
                arguments: vec![
                    entity(),
                    status(),
                    region(),
                    project_type(),
                    start_after(),
                    start_before(),
                    group_by(),
                    limit(),
                ],
            },
            QueryTemplate {
                name: PROJECT_DETAILS.to_string(),
                description: "Full details of one project by name or number".to_string(),
                shape: TemplateShape::Details,
                arguments: vec![
                    ArgumentSpec::new(
                        "project_name",
                        "Project name or part of it",
                        ArgumentKind::Text {
                            column: cols.project_name.clone(),
                            exact: false,
                        },
                    ),
                    ArgumentSpec::new(
                        "project_number",
                        "Project number",
                        ArgumentKind::Text {
                            column: cols.project_number.clone(),
                            exact: true,
                        },
                    ),
                    entity(),
                ],
            },
        ];

        let mut sortable = cols.result_columns.clone();
        if !sortable.contains(&cols.fee) {
            sortable.push(cols.fee.clone());
        }

        Self {
            templates,
            groupable: cols.searchable.clone(),
            sortable,
            max_rows: config.max_rows,
        }
    }

    pub fn get(&self, name: &str) -> Option<&QueryTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.templates.iter().map(|t| t.name.clone()).collect()
    }

    pub fn templates(&self) -> &[QueryTemplate] {
        &self.templates
    }

    pub fn groupable(&self) -> &[String] {
        &self.groupable
    }

    pub fn sortable(&self) -> &[String] {
        &self.sortable
    }

    /// One function definition per named template; unknown names are skipped.
    pub fn function_definitions(&self, names: &[String]) -> Vec<FunctionDefinition> {
        self.templates
            .iter()
            .filter(|t| names.iter().any(|n| n == &t.name))
            .map(|t| FunctionDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: self.parameters_schema(t),
            })
            .collect()
    }

    fn parameters_schema(&self, template: &QueryTemplate) -> Value {
        let mut properties = Map::new();
        for arg in &template.arguments {
            let mut schema = match &arg.kind {
                ArgumentKind::Entity { .. } | ArgumentKind::Text { .. } => json!({"type": "string"}),
                ArgumentKind::Numeric { .. } => json!({"type": "number"}),
                ArgumentKind::Date { .. } => json!({"type": "string", "format": "date"}),
                ArgumentKind::GroupBy => json!({"type": "string", "enum": self.groupable}),
                ArgumentKind::SortBy => json!({"type": "string", "enum": self.sortable}),
                ArgumentKind::SortOrder => json!({"type": "string", "enum": ["asc", "desc"]}),
                ArgumentKind::Limit => {
                    json!({"type": "integer", "minimum": 1, "maximum": self.max_rows})
                }
            };
            schema["description"] = json!(arg.description);
            properties.insert(arg.name.clone(), schema);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": [],
        })
    }

    /// Rejects unknown templates, unknown argument keys and wrongly shaped
    /// values. Null arguments are dropped first.
    pub fn validate(&self, classification: &Classification) -> Result<Classification> {
        let template = self.get(&classification.template_name).ok_or_else(|| {
            EngineError::MalformedClassification(format!(
                "unknown template '{}'",
                classification.template_name
            ))
        })?;

        let mut arguments = Map::new();
        for (key, value) in &classification.raw_arguments {
            if value.is_null() {
                continue;
            }
            let spec = template.argument(key).ok_or_else(|| {
                EngineError::MalformedClassification(format!(
                    "template '{}' has no argument '{}'",
                    template.name, key
                ))
            })?;
            if !shape_ok(&spec.kind, value) {
                return Err(EngineError::MalformedClassification(format!(
                    "argument '{}' has unexpected value {}",
                    key, value
                )));
            }
            arguments.insert(key.clone(), value.clone());
        }

        Ok(Classification {
            template_name: template.name.clone(),
            raw_arguments: arguments,
        })
    }
}

fn shape_ok(kind: &ArgumentKind, value: &Value) -> bool {
    match kind {
        ArgumentKind::Numeric { .. } => {
            value.is_number() || value.as_str().map(|s| s.trim().parse::<f64>().is_ok()).unwrap_or(false)
        }
        ArgumentKind::Limit => {
            value.is_u64() || value.as_str().map(|s| s.trim().parse::<u32>().is_ok()).unwrap_or(false)
        }
        _ => value.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(template: &str, args: Value) -> Classification {
        Classification {
            template_name: template.to_string(),
            raw_arguments: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_standard_catalog_has_four_templates() {
        let catalog = TemplateCatalog::standard(&EngineConfig::default());
        assert_eq!(
            catalog.names(),
            vec![SEARCH_PROJECTS, COUNT_PROJECTS, TOP_BY_FEE, PROJECT_DETAILS]
        );
    }

    #[test]
    fn test_function_definitions_follow_candidates() {
        let catalog = TemplateCatalog::standard(&EngineConfig::default());
        let defs = catalog.function_definitions(&[TOP_BY_FEE.to_string(), "nope".to_string()]);
        assert_eq!(defs.len(), 1);
        let props = defs[0].parameters["properties"].as_object().unwrap();
        assert!(props.contains_key("group_by"));
        assert_eq!(props["limit"]["maximum"], json!(500));
    }

    #[test]
    fn test_validate_drops_nulls() {
        let catalog = TemplateCatalog::standard(&EngineConfig::default());
        let ok = catalog
            .validate(&classification(SEARCH_PROJECTS, json!({"status": "open", "region": null, "limit": 5})))
            .unwrap();
        assert_eq!(ok.raw_arguments.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_output() {
        let catalog = TemplateCatalog::standard(&EngineConfig::default());
        let cases = vec![
            classification("drop_table", json!({})),
            classification(SEARCH_PROJECTS, json!({"colour": "red"})),
            classification(SEARCH_PROJECTS, json!({"status": ["open", "won"]})),
            classification(SEARCH_PROJECTS, json!({"min_fee": "lots"})),
            classification(COUNT_PROJECTS, json!({"limit": 5})),
        ];
        for case in cases {
            let err = catalog.validate(&case).unwrap_err();
            assert!(matches!(err, EngineError::MalformedClassification(_)), "{:?}", case);
        }
    }
}
