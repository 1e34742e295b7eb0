use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use cumulus_common::metadata::DataPackageRecord;
use serde::Deserialize;

use super::queries;
use crate::error::{AppError, AppResult};
use crate::features::FeatureState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub name: Option<String>,
}

pub fn data_packages_routes() -> Router<FeatureState> {
    Router::new()
        .route("/", get(list_data_packages))
        .route("/:id", get(get_data_package))
}

#[tracing::instrument(skip(state))]
async fn list_data_packages(
    State(state): State<FeatureState>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Vec<DataPackageRecord>>> {
    let records = queries::list(state.store.as_ref(), params.name.as_deref()).await?;
    Ok(Json(records))
}

#[tracing::instrument(skip(state))]
async fn get_data_package(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataPackageRecord>> {
    queries::get(state.store.as_ref(), &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("data package {id}")))
}
