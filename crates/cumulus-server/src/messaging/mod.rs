//! Pub/sub fan-out between pipeline workers.
//!
//! Workers publish small string messages on named topics. In this deployment
//! the bus is in-process: [`LocalBus`] pushes onto an unbounded channel that
//! the [`crate::pipeline::router::EventRouter`] drains.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

pub mod queue;

/// Subject carried by every `cache-api` event.
pub const DATA_PACKAGES_SUBJECT: &str = "data_packages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Staged zip ready for extraction
    ProcessUploadStaging,
    /// Extracted child landed under `upload/`
    ProcessUpload,
    ProcessCounts,
    ProcessFlat,
    ProcessStudyMeta,
    CacheApi,
    Completeness,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::ProcessUploadStaging => "process-upload-staging",
            Topic::ProcessUpload => "process-upload",
            Topic::ProcessCounts => "process-counts",
            Topic::ProcessFlat => "process-flat",
            Topic::ProcessStudyMeta => "process-study-meta",
            Topic::CacheApi => "cache-api",
            Topic::Completeness => "completeness",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published message with its send timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub message: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, topic: Topic, message: &str, subject: &str) -> Result<()>;
}

/// In-process bus backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: mpsc::UnboundedSender<Event>,
}

impl LocalBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Publisher for LocalBus {
    async fn publish(&self, topic: Topic, message: &str, subject: &str) -> Result<()> {
        debug!(topic = %topic, subject, message, "Publishing event");
        self.sender
            .send(Event {
                topic,
                message: message.to_string(),
                subject: subject.to_string(),
                sent_at: Utc::now(),
            })
            .map_err(|_| anyhow!("Event bus closed while publishing to {}", topic))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_delivers_in_order() {
        let (bus, mut rx) = LocalBus::new();
        bus.publish(Topic::ProcessUpload, "upload/a", "a").await.unwrap();
        bus.publish(Topic::CacheApi, "", DATA_PACKAGES_SUBJECT).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, Topic::ProcessUpload);
        assert_eq!(first.message, "upload/a");
        assert_eq!(rx.recv().await.unwrap().subject, DATA_PACKAGES_SUBJECT);
    }

    #[tokio::test]
    async fn test_publish_fails_when_receiver_dropped() {
        let (bus, rx) = LocalBus::new();
        drop(rx);
        assert!(bus.publish(Topic::Completeness, "{}", "x").await.is_err());
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::ProcessStudyMeta.to_string(), "process-study-meta");
        assert_eq!(
            serde_json::to_string(&Topic::ProcessUploadStaging).unwrap(),
            "\"process-upload-staging\""
        );
    }
}
