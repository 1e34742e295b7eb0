//! Data-packages catalog rebuild.

use cumulus_common::keys::{encode, Subbucket, SEPARATOR};
use cumulus_common::metadata::{
    lookup, ColumnTypesEntry, DataPackageRecord, COLUMN_TYPES_KEY, DATA_PACKAGES_KEY,
};
use cumulus_common::PackageMetadata;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{PipelineContext, PipelineError};
use crate::storage::{read_json, write_json};

pub const FLAT_PACKAGE_TYPE: &str = "flat";

/// Catalog record for one table, `None` when the table has no backing
/// parquet or no column types yet.
async fn record_for(
    ctx: &PipelineContext,
    table: &str,
    column_types: &Value,
) -> Result<Option<DataPackageRecord>, PipelineError> {
    let Ok(meta) = PackageMetadata::from_package_id(table) else {
        return Ok(None);
    };
    let data_package = meta.data_package()?.to_string();
    let (key, package_key) = match &meta.site {
        Some(site) => (
            encode(
                Subbucket::Flat,
                &PackageMetadata::flat(&meta.study, &data_package, site, &meta.version),
            )?,
            format!("{data_package}{SEPARATOR}{site}"),
        ),
        None => (
            encode(
                Subbucket::Aggregates,
                &PackageMetadata::aggregate(&meta.study, &data_package, &meta.version),
            )?,
            data_package.clone(),
        ),
    };

    if !ctx.store.exists(&key).await? {
        debug!(table, "Table has no backing parquet");
        return Ok(None);
    }
    let Some(entry) = lookup(column_types, &[&meta.study, &package_key, table]) else {
        debug!(table, "Table has no column types");
        return Ok(None);
    };
    let entry: ColumnTypesEntry = serde_json::from_value(entry.clone())?;

    Ok(Some(DataPackageRecord {
        id: table.to_string(),
        study: meta.study.clone(),
        name: data_package,
        version: meta.version.clone(),
        package_type: meta.site.as_ref().map(|_| FLAT_PACKAGE_TYPE.to_string()),
        site: meta.site.clone(),
        columns: entry.columns,
        total: entry.total,
        last_data_update: entry.last_data_update,
        s3_path: entry.s3_path,
    }))
}

#[instrument(skip(ctx))]
pub async fn build_data_packages_cache(ctx: &PipelineContext) -> Result<String, PipelineError> {
    let column_types = read_json::<Value>(ctx.store.as_ref(), COLUMN_TYPES_KEY)
        .await?
        .unwrap_or(Value::Null);

    let mut records = Vec::new();
    for table in ctx.catalog.list_tables().await? {
        if let Some(record) = record_for(ctx, &table, &column_types).await? {
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.id.cmp(&b.id));

    write_json(ctx.store.as_ref(), DATA_PACKAGES_KEY, &records).await?;
    info!(packages = records.len(), "Data packages cache rebuilt");
    Ok(format!("Cached {} data packages", records.len()))
}
