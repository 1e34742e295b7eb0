//! Per-site flat table replacement.

use cumulus_common::keys::{
    decode, encode, encode_archive, prefix, rehome, sibling, Subbucket, SEPARATOR,
};
use cumulus_common::metadata::{ColumnTypesEntry, TransactionEntry};
use cumulus_common::{MetadataDelta, PackageMetadata};
use tracing::{info, instrument, warn};

use super::column_types;
use super::completeness;
use super::{timestamp_now, PipelineContext, PipelineError};
use crate::messaging::{Topic, DATA_PACKAGES_SUBJECT};

#[instrument(skip(ctx), fields(key = %key))]
pub async fn process_flat(ctx: &PipelineContext, key: &str) -> Result<String, PipelineError> {
    if !ctx.store.exists(key).await? {
        return Ok("Nothing to process".to_string());
    }
    let trigger = decode(key)?.meta;
    let study = trigger.study.as_str();
    let data_package = trigger.data_package()?;
    let site = trigger.site()?;
    let version = trigger.version.as_str();

    let flat_meta = PackageMetadata::flat(study, data_package, site, version);
    let flat_key = encode(Subbucket::Flat, &flat_meta)?;
    let package_id = flat_meta.flat_package_id()?;

    let frame = match ctx.read_frame(key).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Flat upload unreadable");
            ctx.store
                .move_object(key, &rehome(key, Subbucket::Error)?)
                .await?;
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
            return Err(e);
        }
    };

    let archived_at = timestamp_now();
    let existing = ctx.store.list(&prefix(Subbucket::Flat, &flat_meta)?).await?;
    let is_new = existing.is_empty();
    for object in existing {
        let archive_key = encode_archive(&decode(&object.key)?.meta, &archived_at)?;
        ctx.store.move_object(&object.key, &archive_key).await?;
    }

    ctx.store.move_object(key, &flat_key).await?;
    ctx.store
        .put(&sibling(&flat_key, "csv"), frame.to_csv()?, Some("text/csv"))
        .await?;

    let now = timestamp_now();
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
    let entry = ColumnTypesEntry {
        columns: column_types::infer(&frame.columns),
        last_data_update: Some(now),
        s3_path: Some(flat_key.clone()),
        total: Some(frame.len().into()),
        ..Default::default()
    };
    ctx.enqueue(&MetadataDelta::column_types(
        study,
        &format!("{data_package}{SEPARATOR}{site}"),
        &package_id,
        &entry,
    )?)
    .await?;

    if is_new && ctx.has_table(&package_id).await? {
        ctx.publish(Topic::CacheApi, "", DATA_PACKAGES_SUBJECT)
            .await?;
    }
    completeness::notify(ctx, site, study).await?;

    info!(package = %package_id, rows = frame.len(), "Flat table replaced");
    Ok(format!("Stored {} rows for {}", frame.len(), package_id))
}
