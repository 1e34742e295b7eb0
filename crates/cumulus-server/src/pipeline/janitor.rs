//! Timer-driven housekeeping: staged upload discovery and stale
//! upload-transaction cleanup.

use chrono::{DateTime, Utc};
use cumulus_common::keys::Subbucket;
use cumulus_common::metadata::{UploadTransaction, UPLOAD_TRANSACTIONS_PREFIX};
use std::collections::HashSet;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::{PipelineContext, PipelineError};
use crate::messaging::Topic;
use crate::storage::{list_keys, read_json};

/// Publishes every new `.zip` under `upload_staging/` once.
pub struct StagingWatcher {
    ctx: PipelineContext,
    seen: HashSet<String>,
}

impl StagingWatcher {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            seen: HashSet::new(),
        }
    }

    /// One scan. Returns the number of uploads published.
    pub async fn poll_once(&mut self) -> Result<usize, PipelineError> {
        let prefix = Subbucket::UploadStaging.prefix();
        let staged: Vec<String> = list_keys(self.ctx.store.as_ref(), &prefix)
            .await?
            .into_iter()
            .filter(|k| k.ends_with(".zip"))
            .collect();

        let mut published = 0;
        for key in &staged {
            if self.seen.contains(key) {
                continue;
            }
            let site = key.split('/').nth(2).unwrap_or_default();
            self.ctx
                .publish(Topic::ProcessUploadStaging, key, site)
                .await?;
            self.seen.insert(key.clone());
            published += 1;
        }
        // Forget keys that have left staging so a re-upload is picked up.
        self.seen.retain(|k| staged.contains(k));
        Ok(published)
    }

    pub fn start(mut self) -> JoinHandle<()> {
        let period = self.ctx.config.staging_poll_interval();
        info!(?period, "Starting staging watcher");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match self.poll_once().await {
                    Ok(0) => {}
                    Ok(n) => info!(uploads = n, "Staged uploads published"),
                    Err(e) => error!(error = %e, "Staging scan failed"),
                }
                if let Err(e) = sweep_stale_transactions(&self.ctx, Utc::now()).await {
                    error!(error = %e, "Stale transaction sweep failed");
                }
            }
        })
    }
}

/// Delete upload transactions older than the configured horizon.
#[instrument(skip(ctx))]
pub async fn sweep_stale_transactions(
    ctx: &PipelineContext,
    now: DateTime<Utc>,
) -> Result<usize, PipelineError> {
    let horizon = ctx.config.stale_transaction_age();
    let mut removed = 0;
    for key in list_keys(ctx.store.as_ref(), UPLOAD_TRANSACTIONS_PREFIX).await? {
        if !key.ends_with(".json") {
            continue;
        }
        let transaction = match read_json::<UploadTransaction>(ctx.store.as_ref(), &key).await {
            Ok(Some(t)) => t,
            Ok(None) => continue,
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable upload transaction");
                continue;
            }
        };
        let Ok(uploaded_at) = DateTime::parse_from_rfc3339(&transaction.uploaded_at) else {
            warn!(key = %key, "Upload transaction has no valid timestamp");
            continue;
        };
        if now - uploaded_at.with_timezone(&Utc) > horizon {
            ctx.store.delete(&key).await?;
            warn!(key = %key, transaction = %transaction.id, "Dropped stalled upload transaction");
            removed += 1;
        }
    }
    Ok(removed)
}
