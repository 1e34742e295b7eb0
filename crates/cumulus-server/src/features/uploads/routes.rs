use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap},
    routing::post,
    Json, Router,
};
use cumulus_common::keys::{encode, normalize_version, Subbucket};
use cumulus_common::{CumulusError, PackageMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::auth::authenticate;
use crate::error::{AppError, AppResult};
use crate::features::FeatureState;

#[derive(Debug, Deserialize)]
pub struct UploadUrlRequest {
    pub study: String,
    pub filename: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct UploadUrlResponse {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub key: String,
    pub expires_in: u64,
}

pub fn uploads_routes() -> Router<FeatureState> {
    Router::new().route("/upload-urls", post(create_upload_url))
}

/// `upload_staging/<study>/<site path>/<version>/<filename>`
pub fn staging_key(request: &UploadUrlRequest, site_path: &str) -> AppResult<String> {
    if !request.filename.ends_with(".zip") {
        return Err(AppError::BadRequest(format!("{} is not a zip", request.filename)));
    }
    let meta = PackageMetadata::new(request.study.as_str(), normalize_version(&request.version))
        .with_site(site_path)
        .with_filename(request.filename.as_str());
    encode(Subbucket::UploadStaging, &meta).map_err(|e| AppError::BadRequest(e.to_string()))
}

#[tracing::instrument(skip(state, headers, body))]
async fn create_upload_url(
    State(state): State<FeatureState>,
    headers: HeaderMap,
    body: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> AppResult<Json<UploadUrlResponse>> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let identity = authenticate(state.store.as_ref(), authorization).await?;
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let key = staging_key(&request, &identity.path)?;
    let presigned = state
        .store
        .presign_upload(&key, state.presign_expiry)
        .await
        .map_err(|e| CumulusError::PresignFailure(e.to_string()))?;

    tracing::info!(site = %identity.site, key = %key, "Issued upload URL");
    Ok(Json(UploadUrlResponse {
        url: presigned.url,
        method: presigned.method,
        headers: presigned.headers,
        key,
        expires_in: state.presign_expiry.as_secs(),
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(filename: &str, version: &str) -> UploadUrlRequest {
        UploadUrlRequest {
            study: "core".into(),
            filename: filename.into(),
            version: version.into(),
        }
    }

    #[test]
    fn test_staging_key() {
        assert_eq!(
            staging_key(&request("core.zip", "99"), "general_hospital").unwrap(),
            "upload_staging/core/general_hospital/099/core.zip"
        );
        assert!(matches!(
            staging_key(&request("core.parquet", "99"), "general_hospital"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            staging_key(&request("core.zip", "v1"), "general_hospital"),
            Err(AppError::BadRequest(_))
        ));
    }
}
