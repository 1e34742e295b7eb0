//! Cross-site aggregate rebuild for one data package version.
//!
//! Triggered by a counts file landing in `latest/`. Sites without a new
//! upload contribute their `last_valid/` copy; each new upload is merged and
//! promoted to `last_valid/`, or moved to `error/` with the previous copy
//! restored when it cannot be merged.

use cumulus_common::keys::{
    decode, encode, encode_archive, package_root, rehome, DecodedKey, Subbucket,
};
use cumulus_common::metadata::{ColumnTypesEntry, TransactionEntry};
use cumulus_common::{CumulusError, FileCategory, MetadataDelta, PackageMetadata};
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

use super::column_types;
use super::completeness;
use super::frame::{cell_at, columns_of, parquet_columns};
use super::powerset::{PowersetMerge, COUNT_COLUMN};
use super::{timestamp_now, PipelineContext, PipelineError};
use crate::messaging::{Topic, DATA_PACKAGES_SUBJECT};

/// Counts files under `root` for the same version, in key order.
async fn members(
    ctx: &PipelineContext,
    root: &str,
    version: &str,
) -> Result<Vec<(String, DecodedKey)>, PipelineError> {
    let mut found = Vec::new();
    for object in ctx.store.list(root).await? {
        if !FileCategory::classify(&object.key).is_counts() {
            continue;
        }
        match decode(&object.key) {
            Ok(decoded) if decoded.meta.version == version => found.push((object.key, decoded)),
            Ok(_) => {}
            Err(e) => warn!(key = %object.key, error = %e, "Ignoring non-canonical key"),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

async fn merge_file(
    ctx: &PipelineContext,
    merge: &mut PowersetMerge,
    key: &str,
    site: &str,
) -> Result<(), PipelineError> {
    let table = ctx.read_table(key).await?;
    merge.add_site(table, site, key)
}

#[instrument(skip(ctx), fields(key = %key))]
pub async fn process_counts(ctx: &PipelineContext, key: &str) -> Result<String, PipelineError> {
    let trigger = decode(key)?.meta;
    let study = trigger.study.as_str();
    let data_package = trigger.data_package()?;
    let version = trigger.version.as_str();
    let trigger_site = trigger.site()?;

    let aggregate_meta = PackageMetadata::aggregate(study, data_package, version);
    let aggregate_key = encode(Subbucket::Aggregates, &aggregate_meta)?;
    let package_id = aggregate_meta.package_id()?;

    let mut merge = PowersetMerge::new();
    if ctx.store.exists(&aggregate_key).await? {
        let columns = parquet_columns(ctx.store.get(&aggregate_key).await?)?;
        merge = merge.with_expected_columns(columns);
    }

    let latest = members(
        ctx,
        &package_root(Subbucket::Latest, study, data_package)?,
        version,
    )
    .await?;
    let last_valid = members(
        ctx,
        &package_root(Subbucket::LastValid, study, data_package)?,
        version,
    )
    .await?;

    let latest_sites: BTreeSet<String> = latest
        .iter()
        .filter_map(|(_, d)| d.meta.site.clone())
        .collect();
    for (lv_key, decoded) in &last_valid {
        let site = decoded.meta.site()?;
        if !latest_sites.contains(site) {
            merge_file(ctx, &mut merge, lv_key, site).await?;
        }
    }

    let archived_at = timestamp_now();
    let mut is_new = false;
    let mut merged_sites = Vec::new();
    for (latest_key, decoded) in &latest {
        let site = decoded.meta.site()?;
        let lv_key = rehome(latest_key, Subbucket::LastValid)?;
        let archive_key = if ctx.store.exists(&lv_key).await? {
            let archive_key = encode_archive(&decoded.meta, &archived_at)?;
            ctx.store.move_object(&lv_key, &archive_key).await?;
            Some(archive_key)
        } else {
            None
        };

        match merge_file(ctx, &mut merge, latest_key, site).await {
            Ok(()) => {
                ctx.store.move_object(latest_key, &lv_key).await?;
                is_new |= archive_key.is_none();
                merged_sites.push(site.to_string());
            }
            Err(e) => {
                warn!(site, file = %latest_key, error = %e, "Upload rejected from aggregate");
                if let Some(archive_key) = &archive_key {
                    ctx.store.move_object(archive_key, &lv_key).await?;
                }
                let entry = TransactionEntry {
                    last_error: Some(timestamp_now()),
                    ..Default::default()
                };
                ctx.enqueue(&MetadataDelta::transaction(
                    site,
                    study,
                    data_package,
                    &package_id,
                    &entry,
                )?)
                .await?;
                ctx.store
                    .move_object(latest_key, &rehome(latest_key, Subbucket::Error)?)
                    .await?;
                if archive_key.is_some() {
                    merge_file(ctx, &mut merge, &lv_key, site).await?;
                }
            }
        }
    }

    let Some(aggregate) = merge.into_batch().filter(|b| b.num_rows() > 0) else {
        return Err(CumulusError::NoData(package_id).into());
    };
    if merged_sites.is_empty() && ctx.store.exists(&aggregate_key).await? {
        info!(package = %package_id, "No upload merged, aggregate left as is");
        completeness::notify(ctx, trigger_site, study).await?;
        return Ok(format!("No new data for {}", package_id));
    }
    ctx.write_table(&aggregate_key, &aggregate).await?;

    let now = timestamp_now();
    for site in &merged_sites {
        let entry = TransactionEntry {
            last_data_update: Some(now.clone()),
            last_aggregation: Some(now.clone()),
            ..Default::default()
        };
        ctx.enqueue(&MetadataDelta::transaction(
            site,
            study,
            data_package,
            &package_id,
            &entry,
        )?)
        .await?;
    }
    let entry = ColumnTypesEntry {
        columns: column_types::infer(&columns_of(&aggregate.schema())),
        last_data_update: Some(now),
        s3_path: Some(aggregate_key.clone()),
        total: cell_at(&aggregate, 0, COUNT_COLUMN).and_then(|cell| cell.to_number()),
        ..Default::default()
    };
    ctx.enqueue(&MetadataDelta::column_types(
        study,
        data_package,
        &package_id,
        &entry,
    )?)
    .await?;

    if is_new && ctx.has_table(&package_id).await? {
        ctx.publish(Topic::CacheApi, "", DATA_PACKAGES_SUBJECT)
            .await?;
    }
    completeness::notify(ctx, trigger_site, study).await?;

    info!(
        package = %package_id,
        rows = aggregate.num_rows(),
        sites = merged_sites.len(),
        "Aggregate written"
    );
    Ok(format!("Aggregated {} rows for {}", aggregate.num_rows(), package_id))
}
