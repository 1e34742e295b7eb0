//! Chart data: filtered, grouped counts over one aggregate

pub mod filters;
pub mod query;
pub mod routes;

pub use filters::{compile, CompiledFilter, FilterTarget, Operator, NONE_SENTINEL};
pub use routes::chart_data_routes;
