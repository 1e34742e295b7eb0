//! Liveness, including a round-trip to the SQL catalog

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::features::FeatureState;

pub fn health_routes() -> Router<FeatureState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<FeatureState>) -> Result<Response, StatusCode> {
    match state.catalog.query("SELECT 1").await {
        Ok(_) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "catalog": state.catalog.database(),
            })),
        )
            .into_response()),
        Err(e) => {
            tracing::error!("Catalog health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
