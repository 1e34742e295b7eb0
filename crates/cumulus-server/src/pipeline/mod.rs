//! Event-driven aggregation pipeline.
//!
//! Each worker is a stateless async function over a [`PipelineContext`],
//! triggered by one bus event:
//!
//! | Topic | Worker |
//! |---|---|
//! | `process-upload-staging` | [`unzip::process_staged_upload`] |
//! | `process-upload` | [`classify::process_upload`] |
//! | `process-counts` | [`merge::process_counts`] |
//! | `process-flat` | [`flat::process_flat`] |
//! | `process-study-meta` | [`study_period::process_study_meta`] |
//! | `completeness` | [`completeness::check_completeness`] |
//! | `cache-api` | [`cache::build_data_packages_cache`] |
//!
//! Metadata documents are never written by workers directly; they enqueue
//! [`MetadataDelta`]s that [`coalescer::MetadataCoalescer`] applies.

use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use cumulus_common::keys::sibling;
use cumulus_common::{CumulusError, MetadataDelta};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::catalog::{Crawler, SqlCatalog};
use crate::config::PipelineConfig;
use crate::messaging::queue::{WorkQueue, METADATA_GROUP};
use crate::messaging::{Publisher, Topic};
use crate::storage::BlobStore;

pub mod cache;
pub mod classify;
pub mod coalescer;
pub mod column_types;
pub mod completeness;
pub mod flat;
pub mod frame;
pub mod janitor;
pub mod merge;
pub mod powerset;
pub mod router;
pub mod study_period;
pub mod unzip;

use frame::{batch_to_parquet, batches_to_delimited, Frame};

/// Body of every 500 a worker returns.
pub const UNEXPECTED_ERROR_BODY: &str = "An unexpected error occurred";

/// Errors a worker can hit: domain failures plus the infrastructure below them.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Domain(#[from] CumulusError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn domain(&self) -> Option<&CumulusError> {
        match self {
            PipelineError::Domain(e) => Some(e),
            PipelineError::Storage(e) => e.downcast_ref::<CumulusError>(),
            _ => None,
        }
    }

    pub fn is_benign(&self) -> bool {
        self.domain().is_some_and(CumulusError::is_benign)
    }
}

/// Outcome of one worker invocation, shaped like an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerResponse {
    pub status: u16,
    pub body: String,
}

impl WorkerResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Error boundary at every worker edge. Details are logged, never returned.
    pub fn from_result(worker: &str, result: Result<String, PipelineError>) -> Self {
        match result {
            Ok(body) => {
                info!(worker, outcome = %body, "Worker finished");
                Self::ok(body)
            }
            Err(e) if e.is_benign() => {
                info!(worker, outcome = %e, "Worker finished in a benign state");
                match e.domain() {
                    Some(CumulusError::StaleArtifact(_)) => {
                        Self::ok(completeness::NOT_COMPLETED)
                    }
                    _ => Self::ok(e.to_string()),
                }
            }
            Err(e) => {
                error!(worker, error = %e, "Worker failed");
                Self {
                    status: 500,
                    body: UNEXPECTED_ERROR_BODY.to_string(),
                }
            }
        }
    }
}

/// Current time as an RFC 3339 string truncated to whole seconds, matching
/// the resolution of object-store modification times.
pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.trunc_subsecs(0).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn BlobStore>,
    pub publisher: Arc<dyn Publisher>,
    pub queue: Arc<dyn WorkQueue>,
    pub catalog: Arc<dyn SqlCatalog>,
    pub crawler: Arc<dyn Crawler>,
    pub config: PipelineConfig,
    pub claims: completeness::ClaimLocks,
}

impl PipelineContext {
    /// Hand a partial document to the coalescer.
    pub async fn enqueue(&self, delta: &MetadataDelta) -> Result<(), PipelineError> {
        let body = serde_json::to_string(delta)?;
        self.queue.send(METADATA_GROUP, &body).await?;
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: Topic,
        message: &str,
        subject: &str,
    ) -> Result<(), PipelineError> {
        self.publisher.publish(topic, message, subject).await?;
        Ok(())
    }

    /// Whether the catalog already serves `table`. New tables reach the
    /// cache through the crawler instead.
    pub async fn has_table(&self, table: &str) -> Result<bool, PipelineError> {
        Ok(self.catalog.list_tables().await?.iter().any(|t| t == table))
    }

    pub async fn read_frame(&self, key: &str) -> Result<Frame, PipelineError> {
        let data = self.store.get(key).await?;
        Frame::from_parquet(data)
    }

    /// Parquet object decoded into one widened batch.
    pub async fn read_table(&self, key: &str) -> Result<RecordBatch, PipelineError> {
        frame::read_table(self.store.get(key).await?)
    }

    /// Write the batch as parquet plus its CSV sibling.
    pub async fn write_table(&self, key: &str, batch: &RecordBatch) -> Result<(), PipelineError> {
        let parquet: Bytes = batch_to_parquet(batch)?;
        self.store
            .put(key, parquet, Some("application/vnd.apache.parquet"))
            .await?;
        let csv = batches_to_delimited(batch.schema(), std::slice::from_ref(batch), b',')?;
        self.store
            .put(&sibling(key, "csv"), csv, Some("text/csv"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_hides_failure_details() {
        let response = WorkerResponse::from_result(
            "merge",
            Err(CumulusError::NoData("study__dp__099".into()).into()),
        );
        assert_eq!(response.status, 500);
        assert_eq!(response.body, UNEXPECTED_ERROR_BODY);
    }

    #[test]
    fn test_boundary_passes_benign_states() {
        let response = WorkerResponse::from_result(
            "completeness",
            Err(CumulusError::AlreadyDispatched("site_a__study".into()).into()),
        );
        assert!(response.is_success());
        assert!(response.body.contains("already dispatched"));

        let stale = WorkerResponse::from_result(
            "completeness",
            Err(CumulusError::StaleArtifact("aggregates/x".into()).into()),
        );
        assert_eq!(stale.body, completeness::NOT_COMPLETED);
    }

    #[test]
    fn test_domain_errors_survive_anyhow() {
        let wrapped: PipelineError =
            anyhow::Error::from(CumulusError::AlreadyDispatched("x".into())).into();
        assert!(wrapped.is_benign());
    }

    #[test]
    fn test_timestamp_has_whole_seconds() {
        let ts = timestamp_now();
        assert!(ts.ends_with('Z'));
        assert!(!ts.contains('.'));
    }
}
