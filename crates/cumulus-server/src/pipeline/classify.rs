//! Routing of single extracted files by name.

use cumulus_common::keys::{decode, rehome, Subbucket};
use cumulus_common::metadata::TransactionEntry;
use cumulus_common::{CumulusError, FileCategory, MetadataDelta, PackageMetadata};
use tracing::{info, instrument, warn};

use super::{format_timestamp, timestamp_now, PipelineContext, PipelineError};
use crate::messaging::Topic;

/// Transaction id a file reports under: flat tables carry the site.
fn transaction_id(meta: &PackageMetadata, category: FileCategory) -> Result<String, CumulusError> {
    match category {
        FileCategory::Flat => meta.flat_package_id(),
        _ => meta.package_id(),
    }
}

#[instrument(skip(ctx), fields(key = %key))]
pub async fn process_upload(ctx: &PipelineContext, key: &str) -> Result<String, PipelineError> {
    let Some(object) = ctx.store.head(key).await? else {
        return Ok("Nothing to process".to_string());
    };
    let decoded = decode(key)?;
    if decoded.subbucket != Subbucket::Upload {
        return Err(CumulusError::MalformedKey(key.to_string()).into());
    }
    let meta = decoded.meta;
    let site = meta.site()?;
    let data_package = meta.data_package()?;
    let category = FileCategory::classify(key);
    let package_id = transaction_id(&meta, category)?;

    let (topic, destination) = match category {
        FileCategory::Archive => {
            ctx.store.delete(key).await?;
            info!("Deleted line-level archive export");
            return Ok("Deleted archive file".to_string());
        }
        FileCategory::NotParquet => {
            let error_key = rehome(key, Subbucket::Error)?;
            ctx.store.move_object(key, &error_key).await?;
            let entry = TransactionEntry {
                last_error: Some(timestamp_now()),
                ..Default::default()
            };
            ctx.enqueue(&MetadataDelta::transaction(
                site,
                &meta.study,
                data_package,
                &package_id,
                &entry,
            )?)
            .await?;
            warn!(error_key = %error_key, "Rejected non-parquet upload");
            return Err(CumulusError::UnexpectedFileType(key.to_string()).into());
        }
        FileCategory::Meta => (
            Topic::ProcessStudyMeta,
            rehome(key, Subbucket::StudyMetadata)?,
        ),
        FileCategory::Flat => (Topic::ProcessFlat, rehome(key, Subbucket::Latest)?),
        FileCategory::Cube | FileCategory::AnnotatedCube | FileCategory::OtherParquet => {
            (Topic::ProcessCounts, rehome(key, Subbucket::Latest)?)
        }
    };

    ctx.store.move_object(key, &destination).await?;
    let entry = TransactionEntry {
        last_upload: Some(format_timestamp(object.last_modified)),
        ..Default::default()
    };
    ctx.enqueue(&MetadataDelta::transaction(
        site,
        &meta.study,
        data_package,
        &package_id,
        &entry,
    )?)
    .await?;
    ctx.publish(topic, &destination, site).await?;

    info!(destination = %destination, topic = %topic, "Routed upload");
    Ok(format!("Moved to {}", destination))
}
