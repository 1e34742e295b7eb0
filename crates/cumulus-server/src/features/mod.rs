//! Feature modules implementing the Cumulus read API
//!
//! Each feature is a vertical slice with its own queries and routes.
//!
//! # Features
//!
//! - **data_packages**: the data-packages catalog built by the cache worker
//! - **chart_data**: filtered, grouped counts over one aggregate
//! - **downloads**: presigned CSV/parquet redirects and parquet conversion
//! - **study_periods**: per-site study date ranges
//! - **uploads**: presigned upload URLs for authenticated sites
//! - **static_files**: dashboard assets kept in the bucket
//! - **health**: liveness

pub mod chart_data;
pub mod data_packages;
pub mod downloads;
pub mod health;
pub mod static_files;
pub mod study_periods;
pub mod uploads;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::SqlCatalog;
use crate::storage::BlobStore;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub store: Arc<dyn BlobStore>,
    pub catalog: Arc<dyn SqlCatalog>,
    /// Lifetime of presigned GET and upload URLs
    pub presign_expiry: Duration,
}

/// Creates the API router with all feature routes mounted
///
/// - `/data-packages` - Catalog listing and lookup
/// - `/chart-data` - Chart queries
/// - `/aggregates`, `/last-valid`, `/from-parquet` - Downloads
/// - `/study-periods` - Study periods
/// - `/upload-urls` - Presigned uploads
/// - `/static` - Static assets
/// - `/health` - Liveness
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .nest("/data-packages", data_packages::data_packages_routes())
        .nest("/chart-data", chart_data::chart_data_routes())
        .nest("/study-periods", study_periods::study_periods_routes())
        .nest("/static", static_files::static_routes())
        .merge(downloads::downloads_routes())
        .merge(uploads::uploads_routes())
        .merge(health::health_routes())
        .with_state(state)
}
