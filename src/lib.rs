//! Natural-language query resolution over the projects dataset.
//!
//! A question is checked by the boundary guards, classified into a query
//! template, its entity mentions are resolved against a live column index and
//! verified by count, and the resulting parameterized query runs against the
//! data source. Follow-up questions carry an immutable context chain.

pub mod classifier;
pub mod config;
pub mod context;
pub mod db;
pub mod disambiguation;
pub mod engine;
pub mod error;
pub mod guards;
pub mod index;
pub mod query;
pub mod resolver;
pub mod response;
pub mod synonyms;

pub use config::EngineConfig;
pub use context::{ContextChain, QueryContext};
pub use engine::{EngineOutcome, QueryEngine, QueryRequest};
pub use error::{EngineError, ErrorKind, Result};
pub use response::QueryResponse;

/// Installs the `tracing` subscriber used by both binaries.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
