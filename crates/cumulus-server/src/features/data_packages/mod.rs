//! Data-packages catalog

pub mod queries;
pub mod routes;

pub use routes::data_packages_routes;
