//! Single writer of the canonical metadata documents.
//!
//! Workers enqueue [`MetadataDelta`]s on one FIFO message group. The queue
//! never hands out a second batch of that group while one is in flight, so
//! batches are applied strictly one after another without any locking on
//! the documents themselves.

use cumulus_common::metadata::apply_all;
use cumulus_common::MetadataDelta;
use serde_json::Value;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{PipelineContext, PipelineError};
use crate::storage::{read_json, write_json};

/// Pause between polls of an empty queue.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Apply one batch of deltas. Returns how many messages were consumed.
///
/// Messages are deleted only after every touched document has been written;
/// a failure leaves the batch to be redelivered once its visibility lapses.
#[instrument(skip(ctx))]
pub async fn drain_batch(ctx: &PipelineContext) -> Result<usize, PipelineError> {
    let messages = ctx
        .queue
        .receive(ctx.config.coalescer_batch_size, ctx.config.queue_visibility())
        .await?;
    if messages.is_empty() {
        return Ok(0);
    }

    let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
    for message in &messages {
        let delta: MetadataDelta = match serde_json::from_str(&message.body) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, body = %message.body, "Dropping unparsable metadata delta");
                continue;
            }
        };
        match grouped.iter_mut().find(|(key, _)| *key == delta.key) {
            Some((_, updates)) => updates.push(delta.updates),
            None => grouped.push((delta.key, vec![delta.updates])),
        }
    }

    for (key, updates) in grouped {
        let mut document = read_json::<Value>(ctx.store.as_ref(), &key)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        debug!(document = %key, updates = updates.len(), "Applying metadata updates");
        apply_all(&mut document, updates);
        write_json(ctx.store.as_ref(), &key, &document).await?;
    }

    for message in &messages {
        ctx.queue.delete(&message.receipt).await?;
    }
    Ok(messages.len())
}

/// Background consumer of the metadata queue.
pub struct MetadataCoalescer {
    ctx: PipelineContext,
}

impl MetadataCoalescer {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn start(self) -> JoinHandle<()> {
        info!(
            batch_size = self.ctx.config.coalescer_batch_size,
            "Starting metadata coalescer"
        );
        tokio::spawn(async move {
            loop {
                match drain_batch(&self.ctx).await {
                    Ok(0) => tokio::time::sleep(IDLE_POLL).await,
                    Ok(applied) => debug!(applied, "Metadata batch applied"),
                    Err(e) => {
                        error!(error = %e, "Metadata batch failed");
                        tokio::time::sleep(IDLE_POLL).await;
                    }
                }
            }
        })
    }
}
