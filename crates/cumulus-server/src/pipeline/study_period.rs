//! Study period extraction from a site's meta export.

use cumulus_common::keys::{decode, prefix, Subbucket};
use cumulus_common::metadata::StudyPeriodEntry;
use cumulus_common::{CumulusError, MetadataDelta};
use tracing::{debug, info, instrument};

use super::completeness;
use super::frame::Frame;
use super::{timestamp_now, PipelineContext, PipelineError};

const MIN_DATE_COLUMN: &str = "min_date";
const MAX_DATE_COLUMN: &str = "max_date";

fn date_bounds(frame: &Frame, key: &str) -> Result<(String, String), CumulusError> {
    let read = |column: &str| {
        frame
            .value(0, column)
            .and_then(|cell| cell.render())
            .ok_or_else(|| CumulusError::NoData(format!("{key}: no {column}")))
    };
    Ok((read(MIN_DATE_COLUMN)?, read(MAX_DATE_COLUMN)?))
}

#[instrument(skip(ctx), fields(key = %key))]
pub async fn process_study_meta(ctx: &PipelineContext, key: &str) -> Result<String, PipelineError> {
    let meta = decode(key)?.meta;
    let site = meta.site()?;
    let package_id = meta.package_id()?;

    let mut candidates = ctx
        .store
        .list(&prefix(Subbucket::StudyMetadata, &meta)?)
        .await?;
    candidates.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.key.cmp(&b.key))
    });
    let Some(newest) = candidates.pop() else {
        return Ok("Nothing to process".to_string());
    };
    for stale in candidates {
        debug!(stale = %stale.key, "Removing superseded meta export");
        ctx.store.delete(&stale.key).await?;
    }

    let frame = ctx.read_frame(&newest.key).await?;
    let (earliest, latest) = date_bounds(&frame, &newest.key)?;
    let entry = StudyPeriodEntry {
        earliest_date: Some(earliest.clone()),
        latest_date: Some(latest.clone()),
        last_data_update: Some(timestamp_now()),
        ..Default::default()
    };
    ctx.enqueue(&MetadataDelta::study_period(
        site,
        &meta.study,
        &package_id,
        &entry,
    )?)
    .await?;
    completeness::notify(ctx, site, &meta.study).await?;

    info!(package = %package_id, earliest = %earliest, latest = %latest, "Study period recorded");
    Ok(format!("Study period {earliest} to {latest}"))
}
