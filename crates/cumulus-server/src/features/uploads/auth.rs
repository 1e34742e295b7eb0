//! Basic-auth against the bucket-held token map.
//!
//! `admin/auth.json` maps the base64 credential to `{"site": ...}`;
//! `admin/metadata.json` maps that site to `{"path": ...}`, the folder its
//! uploads land in under `upload_staging/<study>/`.

use base64::{engine::general_purpose::STANDARD, Engine};
use cumulus_common::CumulusError;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::AppResult;
use crate::storage::{read_json, BlobStore};

pub const AUTH_KEY: &str = "admin/auth.json";
pub const SITE_METADATA_KEY: &str = "admin/metadata.json";

#[derive(Debug, Clone, Deserialize)]
struct AuthEntry {
    site: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SiteEntry {
    path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteIdentity {
    pub site: String,
    /// Upload folder for the site.
    pub path: String,
}

/// The credential of a `Basic` header, checked to be `base64(user:secret)`.
pub fn basic_token(header: Option<&str>) -> Result<&str, CumulusError> {
    let header = header.ok_or_else(|| CumulusError::Unauthorized("missing header".into()))?;
    let token = header
        .strip_prefix("Basic ")
        .map(str::trim)
        .ok_or_else(|| CumulusError::Unauthorized("not a Basic credential".into()))?;
    let decoded = STANDARD
        .decode(token)
        .map_err(|_| CumulusError::Unauthorized("credential is not base64".into()))?;
    if !decoded.contains(&b':') {
        return Err(CumulusError::Unauthorized("credential has no user".into()));
    }
    Ok(token)
}

/// Resolve the caller's site from the `Authorization` header value.
pub async fn authenticate(store: &dyn BlobStore, header: Option<&str>) -> AppResult<SiteIdentity> {
    let token = basic_token(header)?;
    let users: HashMap<String, AuthEntry> = read_json(store, AUTH_KEY).await?.unwrap_or_default();
    let site = users
        .get(token)
        .map(|entry| entry.site.clone())
        .ok_or_else(|| CumulusError::Forbidden("unknown credential".into()))?;

    let sites: HashMap<String, SiteEntry> =
        read_json(store, SITE_METADATA_KEY).await?.unwrap_or_default();
    let path = sites
        .get(&site)
        .map(|entry| entry.path.clone())
        .ok_or_else(|| CumulusError::Forbidden(format!("site {site} has no upload path")))?;
    Ok(SiteIdentity { site, path })
}
