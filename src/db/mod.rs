//! Data source access
//!
//! The engine talks to the projects table through the `DataSource` trait:
//! Postgres in production, an in-memory table for fixtures and demos.

pub mod connection;
pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::query::plan::{ParameterizedQuery, Row};
use async_trait::async_trait;

pub use connection::init_pool;
pub use memory::MemoryDataSource;
pub use postgres::PgDataSource;

/// Read-only access to the dataset.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Runs a compiled query and returns its rows.
    async fn query(&self, query: &ParameterizedQuery) -> Result<Vec<Row>>;

    fn name(&self) -> &str;
}
