use anyhow::Result;
use cumulus_common::keys::{decode, Subbucket, SEPARATOR};
use cumulus_common::metadata::{lookup, ColumnTypes, ColumnTypesEntry, COLUMN_TYPES_KEY};
use serde_json::Value;

use crate::storage::{read_json, BlobStore};

/// Column types recorded for the package a download key belongs to.
///
/// `last_valid/` files share the aggregate's entry.
pub async fn column_types_for(store: &dyn BlobStore, key: &str) -> Result<Option<ColumnTypes>> {
    let Ok(decoded) = decode(key) else {
        return Ok(None);
    };
    let meta = &decoded.meta;
    let dp = meta.data_package()?;
    let (package_key, package_id) = match decoded.subbucket {
        Subbucket::Flat => (
            format!("{dp}{SEPARATOR}{}", meta.site()?),
            meta.flat_package_id()?,
        ),
        _ => (dp.to_string(), meta.package_id()?),
    };
    let Some(document) = read_json::<Value>(store, COLUMN_TYPES_KEY).await? else {
        return Ok(None);
    };
    Ok(lookup(&document, &[&meta.study, &package_key, &package_id])
        .and_then(|entry| serde_json::from_value::<ColumnTypesEntry>(entry.clone()).ok())
        .map(|entry| entry.columns))
}
