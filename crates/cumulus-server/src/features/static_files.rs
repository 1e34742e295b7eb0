//! Dashboard assets kept under `static/` in the bucket

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cumulus_common::keys::Subbucket;

use crate::error::{AppError, AppResult};
use crate::features::FeatureState;

pub fn static_routes() -> Router<FeatureState> {
    Router::new().route("/*path", get(get_static))
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

#[tracing::instrument(skip(state))]
async fn get_static(State(state): State<FeatureState>, Path(path): Path<String>) -> AppResult<Response> {
    if path.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(AppError::BadRequest(format!("invalid path {path}")));
    }
    let key = format!("{}{path}", Subbucket::Static.prefix());
    if !state.store.exists(&key).await? {
        return Err(AppError::NotFound(key));
    }
    let body = state.store.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, content_type(&path))], body).into_response())
}
