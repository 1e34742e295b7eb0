use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};

use super::query::{self, ChartData, ChartRequest};
use crate::error::{AppError, AppResult};
use crate::features::FeatureState;

pub fn chart_data_routes() -> Router<FeatureState> {
    Router::new().route("/:id", get(get_chart_data))
}

/// `column` is required; `filter` may repeat, one group per value.
fn parse_params(params: Vec<(String, String)>) -> AppResult<ChartRequest> {
    let mut request = ChartRequest::default();
    for (name, value) in params {
        match name.as_str() {
            "column" => request.column = value,
            "stratifier" if !value.is_empty() => request.stratifier = Some(value),
            "filter" => request.filters.push(value),
            _ => {}
        }
    }
    if request.column.is_empty() {
        return Err(AppError::BadRequest("missing column".to_string()));
    }
    Ok(request)
}

#[tracing::instrument(skip(state, params))]
async fn get_chart_data(
    State(state): State<FeatureState>,
    Path(id): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> AppResult<Json<ChartData>> {
    let request = parse_params(params)?;
    let data = query::chart_data(state.store.as_ref(), state.catalog.as_ref(), &id, &request).await?;
    Ok(Json(data))
}
