//! Downloads: presigned redirects to canonical artifacts and on-the-fly
//! parquet conversion

pub mod queries;
pub mod routes;

pub use routes::downloads_routes;

/// Comma separated column names of the redirected artifact.
pub const COLUMN_NAMES_HEADER: &str = "x-column-names";
/// Comma separated dashboard type tags, aligned with [`COLUMN_NAMES_HEADER`].
pub const COLUMN_TYPES_HEADER: &str = "x-column-types";
