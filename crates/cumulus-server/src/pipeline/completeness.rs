//! Upload fan-in detection.
//!
//! One zip expands into many files processed independently. Every processed
//! file publishes a completeness check for its `(site, study)`; the check
//! that finds every expected artifact in place deletes the upload
//! transaction and dispatches exactly one crawl or cache refresh. Deleting
//! the transaction is the commit point, so later checks for the same upload
//! come back as already dispatched. Checks for one transaction run one at a
//! time under its [`ClaimLocks`] entry, which makes the read and the delete
//! a single step within the process.

use anyhow::Context;
use chrono::{DateTime, Utc};
use cumulus_common::files::data_package_from_filename;
use cumulus_common::keys::{encode, Subbucket};
use cumulus_common::metadata::{upload_transaction_key, UploadTransaction};
use cumulus_common::{CumulusError, PackageMetadata};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

use super::{PipelineContext, PipelineError};
use crate::catalog::CrawlerStatus;
use crate::messaging::{Topic, DATA_PACKAGES_SUBJECT};
use crate::storage::read_json;

pub const NOT_COMPLETED: &str = "Processing not completed";
pub const COVERED_BY_CRAWL: &str = "Covered by subsequent crawl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessMessage {
    pub site: String,
    pub study: String,
    pub sent_at: DateTime<Utc>,
}

/// One async lock per upload transaction key.
#[derive(Debug, Clone, Default)]
pub struct ClaimLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ClaimLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody else holds are dropped as new ones are taken.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Ask for a completeness check of the site's current upload of `study`.
pub async fn notify(ctx: &PipelineContext, site: &str, study: &str) -> Result<(), PipelineError> {
    let message = CompletenessMessage {
        site: site.to_string(),
        study: study.to_string(),
        sent_at: Utc::now(),
    };
    ctx.publish(Topic::Completeness, &serde_json::to_string(&message)?, site)
        .await
}

/// An artifact an upload must produce and the catalog table it becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Expected {
    key: String,
    table: String,
}

fn expected_artifacts(
    site: &str,
    study: &str,
    transaction: &UploadTransaction,
) -> Result<Vec<Expected>, CumulusError> {
    let version = transaction.version.as_str();
    let mut expected = Vec::new();
    for filename in transaction.cube.iter().chain(&transaction.annotated_cube) {
        let dp = data_package_from_filename(study, filename)?;
        let meta = PackageMetadata::aggregate(study, &dp, version);
        expected.push(Expected {
            key: encode(Subbucket::Aggregates, &meta)?,
            table: meta.package_id()?,
        });
    }
    for filename in &transaction.flat {
        let dp = data_package_from_filename(study, filename)?;
        let meta = PackageMetadata::flat(study, &dp, site, version);
        expected.push(Expected {
            key: encode(Subbucket::Flat, &meta)?,
            table: meta.flat_package_id()?,
        });
    }
    Ok(expected)
}

async fn wait_for_idle_crawler(ctx: &PipelineContext) -> Result<CrawlerStatus, PipelineError> {
    let attempts = ctx.config.crawler_poll_attempts;
    for attempt in 1..=attempts {
        let status = ctx.crawler.status().await?;
        if status.is_idle() {
            return Ok(status);
        }
        debug!(attempt, state = ?status.state, "Crawler busy");
        if attempt < attempts {
            tokio::time::sleep(ctx.config.crawler_poll_interval()).await;
        }
    }
    Err(CumulusError::CrawlerBusy(ctx.catalog.database().to_string()).into())
}

#[instrument(skip(ctx, message), fields(site = %message.site, study = %message.study))]
pub async fn check_completeness(
    ctx: &PipelineContext,
    message: &CompletenessMessage,
) -> Result<String, PipelineError> {
    let transaction_key = upload_transaction_key(&message.site, &message.study);
    let _claim = ctx.claims.acquire(&transaction_key).await;
    let Some(transaction) =
        read_json::<UploadTransaction>(ctx.store.as_ref(), &transaction_key).await?
    else {
        return Err(CumulusError::AlreadyDispatched(transaction_key).into());
    };
    let uploaded_at = DateTime::parse_from_rfc3339(&transaction.uploaded_at)
        .with_context(|| format!("Invalid uploaded_at in {}", transaction_key))?
        .with_timezone(&Utc);

    let expected = expected_artifacts(&message.site, &message.study, &transaction)?;
    let window = ctx.config.completeness_window();
    for artifact in &expected {
        let Some(object) = ctx.store.head(&artifact.key).await? else {
            debug!(missing = %artifact.key, "Artifact not written yet");
            return Ok(NOT_COMPLETED.to_string());
        };
        if object.last_modified < uploaded_at || object.last_modified - uploaded_at > window {
            return Err(CumulusError::StaleArtifact(artifact.key.clone()).into());
        }
    }

    let tables: HashSet<String> = ctx.catalog.list_tables().await?.into_iter().collect();
    let missing: Vec<&str> = expected
        .iter()
        .map(|e| e.table.as_str())
        .filter(|t| !tables.contains(*t))
        .collect();

    if missing.is_empty() {
        if !ctx.store.delete_existing(&transaction_key).await? {
            return Err(CumulusError::AlreadyDispatched(transaction_key).into());
        }
        ctx.publish(Topic::CacheApi, "", DATA_PACKAGES_SUBJECT)
            .await?;
        info!(transaction = %transaction.id, "Upload complete, cache refresh dispatched");
        return Ok("Cache refresh dispatched".to_string());
    }

    let status = wait_for_idle_crawler(ctx).await?;
    if !ctx.store.delete_existing(&transaction_key).await? {
        return Err(CumulusError::AlreadyDispatched(transaction_key).into());
    }
    if status
        .last_crawl_start
        .is_some_and(|started| started > message.sent_at)
    {
        info!(transaction = %transaction.id, "Upload covered by a later crawl");
        return Ok(COVERED_BY_CRAWL.to_string());
    }
    ctx.crawler.start().await?;
    info!(transaction = %transaction.id, tables = ?missing, "Upload complete, crawler started");
    Ok("Crawler started".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_artifacts_cover_every_category() {
        let transaction = UploadTransaction {
            id: "t".into(),
            uploaded_at: "2026-01-01T00:00:00Z".into(),
            version: "099".into(),
            cube: vec!["core__count_encounter.cube.parquet".into()],
            flat: vec!["core__patients.flat.parquet".into()],
            annotated_cube: vec!["core__count_dx.annotated_cube.parquet".into()],
        };
        let tables: Vec<_> = expected_artifacts("site_a", "core", &transaction)
            .unwrap()
            .into_iter()
            .map(|e| e.table)
            .collect();
        assert_eq!(
            tables,
            vec![
                "core__count_encounter__099",
                "core__count_dx__099",
                "core__patients__site_a__099",
            ]
        );
    }

    #[test]
    fn test_message_wire_shape() {
        let raw = r#"{"site":"site_a","study":"core","sent_at":"2026-01-01T00:00:00Z"}"#;
        let message: CompletenessMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.site, "site_a");
    }
}
