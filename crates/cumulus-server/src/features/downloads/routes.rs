use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cumulus_common::keys::Subbucket;
use serde::Deserialize;

use super::queries::{self, ExportFormat};
use super::{COLUMN_NAMES_HEADER, COLUMN_TYPES_HEADER};
use crate::error::{AppError, AppResult};
use crate::features::FeatureState;

#[derive(Debug, Deserialize)]
pub struct FromParquetParams {
    pub s3_path: String,
    #[serde(default, rename = "type")]
    pub format: ExportFormat,
}

pub fn downloads_routes() -> Router<FeatureState> {
    Router::new()
        .route("/aggregates", get(list_aggregates))
        .route("/aggregates/*path", get(get_aggregate))
        .route("/last-valid", get(list_last_valid))
        .route("/last-valid/*path", get(get_last_valid))
        .route("/from-parquet", get(from_parquet))
}

async fn list_aggregates(State(state): State<FeatureState>) -> AppResult<Json<Vec<String>>> {
    Ok(Json(
        queries::list_artifacts(state.store.as_ref(), Subbucket::Aggregates).await?,
    ))
}

async fn list_last_valid(State(state): State<FeatureState>) -> AppResult<Json<Vec<String>>> {
    Ok(Json(
        queries::list_artifacts(state.store.as_ref(), Subbucket::LastValid).await?,
    ))
}

async fn get_aggregate(
    State(state): State<FeatureState>,
    Path(path): Path<String>,
) -> AppResult<Response> {
    redirect(&state, Subbucket::Aggregates, &path).await
}

async fn get_last_valid(
    State(state): State<FeatureState>,
    Path(path): Path<String>,
) -> AppResult<Response> {
    redirect(&state, Subbucket::LastValid, &path).await
}

fn joined_header(values: impl Iterator<Item = String>) -> Option<HeaderValue> {
    HeaderValue::from_str(&values.collect::<Vec<_>>().join(",")).ok()
}

/// 302 to a presigned GET for an existing artifact, with its column names
/// and types attached.
#[tracing::instrument(skip(state))]
async fn redirect(state: &FeatureState, subbucket: Subbucket, path: &str) -> AppResult<Response> {
    if path.split('/').any(|segment| segment == "..") {
        return Err(AppError::BadRequest(format!("invalid path {path}")));
    }
    let key = format!("{}{}", subbucket.prefix(), path.trim_start_matches('/'));
    if !state.store.exists(&key).await? {
        return Err(AppError::NotFound(key));
    }

    let content_type = key.ends_with(".csv").then_some("text/csv");
    let url = state
        .store
        .presign_get(&key, state.presign_expiry, content_type)
        .await?;

    let mut headers = HeaderMap::new();
    let location = HeaderValue::from_str(&url)
        .map_err(|e| anyhow::anyhow!("Presigned URL is not a valid header: {e}"))?;
    headers.insert(header::LOCATION, location);
    if let Some(types) = queries::column_types_for(state.store.as_ref(), &key).await? {
        if let Some(names) = joined_header(types.names().map(str::to_string)) {
            headers.insert(HeaderName::from_static(COLUMN_NAMES_HEADER), names);
        }
        if let Some(tags) = joined_header(types.tags().map(|t| t.to_string())) {
            headers.insert(HeaderName::from_static(COLUMN_TYPES_HEADER), tags);
        }
    }
    Ok((StatusCode::FOUND, headers).into_response())
}

#[tracing::instrument(skip(state))]
async fn from_parquet(
    State(state): State<FeatureState>,
    Query(params): Query<FromParquetParams>,
) -> AppResult<Response> {
    let key = params.s3_path.trim_start_matches('/');
    if !queries::is_convertible(key) {
        return Err(AppError::BadRequest(format!("cannot convert {key}")));
    }
    if !state.store.exists(key).await? {
        return Err(AppError::NotFound(key.to_string()));
    }
    let data = state.store.get(key).await?;
    let body = queries::convert(data, params.format)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, params.format.content_type())],
        body,
    )
        .into_response())
}
