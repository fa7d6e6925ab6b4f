//! Query building and execution

pub mod builder;
pub mod executor;
pub mod plan;

pub use builder::QueryBuilder;
pub use executor::QueryExecutor;
pub use plan::{Filter, ParameterizedQuery, Projection, QueryPlan, Row};
