//! Study periods, read straight from `metadata/study_periods.json`
//!
//! The document is keyed `site -> study -> package id`.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use cumulus_common::metadata::{lookup, STUDY_PERIODS_KEY};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::features::FeatureState;
use crate::storage::read_json;

pub fn study_periods_routes() -> Router<FeatureState> {
    Router::new()
        .route("/", get(all_study_periods))
        .route("/:site", get(site_study_periods))
        .route("/:site/:study", get(study_period))
}

async fn document(state: &FeatureState) -> AppResult<Value> {
    Ok(read_json(state.store.as_ref(), STUDY_PERIODS_KEY)
        .await?
        .unwrap_or_else(|| json!({})))
}

fn subtree(document: &Value, path: &[&str]) -> AppResult<Json<Value>> {
    lookup(document, path)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("study period {}", path.join("/"))))
}

async fn all_study_periods(State(state): State<FeatureState>) -> AppResult<Json<Value>> {
    Ok(Json(document(&state).await?))
}

#[tracing::instrument(skip(state))]
async fn site_study_periods(
    State(state): State<FeatureState>,
    Path(site): Path<String>,
) -> AppResult<Json<Value>> {
    subtree(&document(&state).await?, &[&site])
}

#[tracing::instrument(skip(state))]
async fn study_period(
    State(state): State<FeatureState>,
    Path((site, study)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    subtree(&document(&state).await?, &[&site, &study])
}
