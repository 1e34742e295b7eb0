//! Topic to worker dispatch.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::completeness::CompletenessMessage;
use super::{
    cache, classify, completeness, flat, merge, study_period, unzip, PipelineContext,
    PipelineError, WorkerResponse,
};
use crate::messaging::{Event, Topic};

/// Run the worker subscribed to the event's topic behind the error boundary.
pub async fn dispatch(ctx: &PipelineContext, event: &Event) -> WorkerResponse {
    let key = event.message.as_str();
    let (worker, result) = match event.topic {
        Topic::ProcessUploadStaging => ("unzip", unzip::process_staged_upload(ctx, key).await),
        Topic::ProcessUpload => ("classify", classify::process_upload(ctx, key).await),
        Topic::ProcessCounts => ("merge", merge::process_counts(ctx, key).await),
        Topic::ProcessFlat => ("flat", flat::process_flat(ctx, key).await),
        Topic::ProcessStudyMeta => (
            "study_period",
            study_period::process_study_meta(ctx, key).await,
        ),
        Topic::Completeness => ("completeness", check(ctx, &event.message).await),
        Topic::CacheApi => ("cache", cache::build_data_packages_cache(ctx).await),
    };
    WorkerResponse::from_result(worker, result)
}

async fn check(ctx: &PipelineContext, body: &str) -> Result<String, PipelineError> {
    let message: CompletenessMessage = serde_json::from_str(body)?;
    completeness::check_completeness(ctx, &message).await
}

/// Drains the bus, running each event on its own task.
pub struct EventRouter {
    ctx: PipelineContext,
    events: mpsc::UnboundedReceiver<Event>,
}

impl EventRouter {
    pub fn new(ctx: PipelineContext, events: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { ctx, events }
    }

    pub fn start(mut self) -> JoinHandle<()> {
        info!("Starting event router");
        tokio::spawn(async move {
            while let Some(event) = self.events.recv().await {
                debug!(topic = %event.topic, subject = %event.subject, "Dispatching event");
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    let response = dispatch(&ctx, &event).await;
                    if !response.is_success() {
                        warn!(topic = %event.topic, message = %event.message, "Event handler failed");
                    }
                });
            }
            info!("Event bus closed, router stopped");
        })
    }
}
