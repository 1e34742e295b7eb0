//! # Cumulus Server
//!
//! Aggregation pipeline and read API for multi-site powerset counts.
//!
//! Sites upload zipped parquet exports. The pipeline unpacks them, merges
//! each site's powerset counts into a cross-site aggregate, keeps per-site
//! flat tables, records study periods and column types, and republishes a
//! data-packages catalog once every artifact of an upload has landed. The
//! read API serves that catalog, chart queries over the crawled aggregates,
//! downloads and presigned upload URLs.
//!
//! ## Architecture
//!
//! - **storage**: the blob-store contract, S3 and in-memory backends
//! - **messaging**: topic bus and the FIFO metadata queue
//! - **catalog**: SQL catalog and schema crawler over the aggregates
//! - **pipeline**: the event workers and the metadata coalescer
//! - **features**: HTTP vertical slices (data packages, chart data, ...)
//!
//! Every worker reads and writes through trait objects held by a
//! [`pipeline::PipelineContext`], so the whole pipeline runs in process
//! against [`storage::MemoryStorage`] and [`messaging::queue::MemoryQueue`]
//! in tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cumulus_server::{config::Config, features, storage::S3Storage};
//! use std::sync::Arc;
//!
//! # async fn run(catalog: Arc<dyn cumulus_server::catalog::SqlCatalog>) -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(S3Storage::new(config.storage.clone()).await?);
//! let state = features::FeatureState {
//!     store,
//!     catalog,
//!     presign_expiry: config.pipeline.presign_expiry(),
//! };
//! let app = cumulus_server::router(state, &config.cors);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod features;
pub mod messaging;
pub mod middleware;
pub mod pipeline;
pub mod storage;

pub use error::{AppError, AppResult};

use axum::Router;
use tower_http::compression::CompressionLayer;

/// The HTTP application: feature routes plus the middleware stack.
pub fn router(state: features::FeatureState, cors: &config::CorsConfig) -> Router {
    features::router(state)
        // Apply layers from innermost to outermost
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(cors))
}
