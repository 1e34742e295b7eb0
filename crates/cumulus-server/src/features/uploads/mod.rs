//! Presigned upload URLs for authenticated sites

pub mod auth;
pub mod routes;

pub use auth::{authenticate, SiteIdentity, AUTH_KEY, SITE_METADATA_KEY};
pub use routes::uploads_routes;
