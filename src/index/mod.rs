//! Column value index and search-term derivation.

pub mod column_index;
pub mod search_terms;

pub use column_index::{
    distinct_values_plan, ColumnSnapshot, ColumnValueIndex, RefreshReport, SimilarValue,
};
pub use search_terms::normalize;
