//! FIFO work queue with message groups and visibility timeouts.
//!
//! A group that has a message in flight (received, not yet deleted, visibility
//! not expired) is withheld from every other receiver. With a single group
//! this makes the consumer a mailbox: at most one batch is ever in flight.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Message group shared by every metadata delta.
pub const METADATA_GROUP: &str = "cumulus";

/// Largest batch a single receive may return.
pub const MAX_RECEIVE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub receipt: String,
    pub body: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    async fn send(&self, group: &str, body: &str) -> Result<()>;

    /// Up to `max` (capped at [`MAX_RECEIVE`]) messages in FIFO order.
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>>;

    async fn delete(&self, receipt: &str) -> Result<()>;
}

#[derive(Debug)]
struct Entry {
    group: String,
    body: String,
    receipt: Option<String>,
    invisible_until: Option<Instant>,
}

impl Entry {
    fn in_flight(&self, now: Instant) -> bool {
        self.invisible_until.is_some_and(|until| until > now)
    }
}

/// In-process queue. Clones share the same messages.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    entries: Arc<Mutex<VecDeque<Entry>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet deleted, in flight or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, group: &str, body: &str) -> Result<()> {
        self.entries.lock().await.push_back(Entry {
            group: group.to_string(),
            body: body.to_string(),
            receipt: None,
            invisible_until: None,
        });
        Ok(())
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let blocked: HashSet<String> = entries
            .iter()
            .filter(|e| e.in_flight(now))
            .map(|e| e.group.clone())
            .collect();

        let mut batch = Vec::new();
        for entry in entries.iter_mut() {
            if batch.len() >= max.min(MAX_RECEIVE) {
                break;
            }
            if blocked.contains(&entry.group) {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            entry.receipt = Some(receipt.clone());
            entry.invisible_until = Some(now + visibility);
            batch.push(QueueMessage {
                receipt,
                body: entry.body.clone(),
            });
        }

        Ok(batch)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .retain(|e| e.receipt.as_deref() != Some(receipt));
        Ok(())
    }
}

/// Postgres-backed queue over the `metadata_queue` table.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    consumer: String,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            consumer: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    #[instrument(skip(self, body))]
    async fn send(&self, group: &str, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO metadata_queue (group_id, body) VALUES ($1, $2)")
            .bind(group)
            .bind(body)
            .execute(&self.pool)
            .await
            .context("Failed to enqueue message")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>> {
        let mut tx = self.pool.begin().await?;

        // Serialise receivers so the in-flight check and the claim are atomic.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('metadata_queue'))")
            .execute(&mut *tx)
            .await?;

        let mut rows: Vec<(i64, Uuid, String)> = sqlx::query_as(
            r#"
            WITH blocked AS (
                SELECT DISTINCT group_id
                FROM metadata_queue
                WHERE receipt IS NOT NULL AND visible_at > NOW()
            ),
            next AS (
                SELECT id
                FROM metadata_queue
                WHERE group_id NOT IN (SELECT group_id FROM blocked)
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE metadata_queue q
            SET receipt = gen_random_uuid(),
                claimed_by = $3,
                visible_at = NOW() + make_interval(secs => $2)
            FROM next
            WHERE q.id = next.id
            RETURNING q.id, q.receipt, q.body
            "#,
        )
        .bind(max.min(MAX_RECEIVE) as i64)
        .bind(visibility.as_secs_f64())
        .bind(&self.consumer)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to claim queue messages")?;

        tx.commit().await?;

        rows.sort_by_key(|(id, _, _)| *id);
        debug!(count = rows.len(), "Received queue messages");

        Ok(rows
            .into_iter()
            .map(|(_, receipt, body)| QueueMessage {
                receipt: receipt.to_string(),
                body,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, receipt: &str) -> Result<()> {
        let receipt: Uuid = receipt.parse().context("Invalid queue receipt")?;
        sqlx::query("DELETE FROM metadata_queue WHERE receipt = $1")
            .bind(receipt)
            .execute(&self.pool)
            .await
            .context("Failed to delete queue message")?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_group_is_withheld_while_in_flight() {
        let queue = MemoryQueue::new();
        queue.send(METADATA_GROUP, "a").await.unwrap();
        queue.send(METADATA_GROUP, "b").await.unwrap();

        let first = queue.receive(1, VISIBILITY).await.unwrap();
        assert_eq!(first[0].body, "a");
        assert!(queue.receive(10, VISIBILITY).await.unwrap().is_empty());

        queue.delete(&first[0].receipt).await.unwrap();
        let second = queue.receive(10, VISIBILITY).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "b");
    }

    #[tokio::test]
    async fn test_receive_caps_batch_size() {
        let queue = MemoryQueue::new();
        for i in 0..15 {
            queue.send(METADATA_GROUP, &i.to_string()).await.unwrap();
        }
        let batch = queue.receive(50, VISIBILITY).await.unwrap();
        assert_eq!(batch.len(), MAX_RECEIVE);
        assert_eq!(batch[0].body, "0");
        assert_eq!(batch[9].body, "9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_expiry_redelivers() {
        let queue = MemoryQueue::new();
        queue.send(METADATA_GROUP, "a").await.unwrap();

        let first = queue.receive(1, VISIBILITY).await.unwrap();
        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;

        let again = queue.receive(1, VISIBILITY).await.unwrap();
        assert_eq!(again[0].body, "a");
        assert_ne!(again[0].receipt, first[0].receipt);

        // the stale receipt no longer deletes anything
        queue.delete(&first[0].receipt).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let queue = MemoryQueue::new();
        queue.send("g1", "a").await.unwrap();
        queue.send("g2", "b").await.unwrap();

        let _held = queue.receive(1, VISIBILITY).await.unwrap();
        let other = queue.receive(10, VISIBILITY).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].body, "b");
    }
}
