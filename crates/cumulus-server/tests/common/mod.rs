//! Shared fixtures for the integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeSet;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zip::write::SimpleFileOptions;

use cumulus_common::CumulusError;
use cumulus_server::catalog::{
    crawl_targets, CrawlerState, CrawlerStatus, Crawler, QueryResult, SqlCatalog, SqlDialect,
};
use cumulus_server::config::PipelineConfig;
use cumulus_server::messaging::queue::MemoryQueue;
use cumulus_server::messaging::{Event, LocalBus, Publisher, Topic, DATA_PACKAGES_SUBJECT};
use cumulus_server::pipeline::frame::{Cell, Column, ColumnKind, Frame};
use cumulus_server::pipeline::completeness::ClaimLocks;
use cumulus_server::pipeline::{coalescer, router, PipelineContext, WorkerResponse};
use cumulus_server::storage::{BlobStore, MemoryStorage};

pub const DATABASE: &str = "cumulus";

/// Catalog double: tables are whatever the crawler registered, queries
/// return a canned result and are recorded.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: Mutex<BTreeSet<String>>,
    queries: Mutex<Vec<String>>,
    result: Mutex<QueryResult>,
}

impl MemoryCatalog {
    pub fn register(&self, table: &str) {
        self.tables.lock().unwrap().insert(table.to_string());
    }

    pub fn respond_with(&self, result: QueryResult) {
        *self.result.lock().unwrap() = result;
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlCatalog for MemoryCatalog {
    fn database(&self) -> &str {
        DATABASE
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Athena
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.lock().unwrap().iter().cloned().collect())
    }

    async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.result.lock().unwrap().clone())
    }
}

/// Crawler double that registers every crawl target synchronously and
/// publishes `cache-api` like the real one.
pub struct MemoryCrawler {
    store: Arc<dyn BlobStore>,
    catalog: Arc<MemoryCatalog>,
    publisher: Arc<dyn Publisher>,
    status: Mutex<CrawlerStatus>,
    pub starts: AtomicUsize,
}

impl MemoryCrawler {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: CrawlerState) {
        self.status.lock().unwrap().state = state;
    }
}

#[async_trait]
impl Crawler for MemoryCrawler {
    async fn status(&self) -> Result<CrawlerStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn start(&self) -> Result<()> {
        {
            let mut status = self.status.lock().unwrap();
            if !status.is_idle() {
                return Err(CumulusError::CrawlerBusy(DATABASE.to_string()).into());
            }
            status.last_crawl_start = Some(Utc::now());
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        for target in crawl_targets(self.store.as_ref()).await? {
            self.catalog.register(&target.table);
        }
        self.publisher
            .publish(Topic::CacheApi, "", DATA_PACKAGES_SUBJECT)
            .await
    }
}

/// Everything a pipeline test needs, wired to in-memory backends.
pub struct Harness {
    pub ctx: PipelineContext,
    pub store: Arc<MemoryStorage>,
    pub catalog: Arc<MemoryCatalog>,
    pub crawler: Arc<MemoryCrawler>,
    events: mpsc::UnboundedReceiver<Event>,
    /// Every event dispatched so far, in order.
    pub seen: Vec<Event>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStorage::new());
        let (bus, events) = LocalBus::new();
        let publisher: Arc<dyn Publisher> = Arc::new(bus);
        let catalog = Arc::new(MemoryCatalog::default());
        let crawler = Arc::new(MemoryCrawler {
            store: store.clone(),
            catalog: catalog.clone(),
            publisher: publisher.clone(),
            status: Mutex::new(CrawlerStatus {
                state: CrawlerState::Ready,
                last_crawl_start: None,
            }),
            starts: AtomicUsize::new(0),
        });
        let config = PipelineConfig {
            crawler_poll_attempts: 1,
            crawler_poll_secs: 0,
            ..PipelineConfig::default()
        };
        let ctx = PipelineContext {
            store: store.clone(),
            publisher,
            queue: Arc::new(MemoryQueue::new()),
            catalog: catalog.clone(),
            crawler: crawler.clone(),
            config,
            claims: ClaimLocks::new(),
        };
        Self {
            ctx,
            store,
            catalog,
            crawler,
            events,
            seen: Vec::new(),
        }
    }

    pub async fn publish(&self, topic: Topic, message: &str, subject: &str) {
        self.ctx.publish(topic, message, subject).await.unwrap();
    }

    /// Apply every queued metadata delta.
    pub async fn drain_metadata(&self) {
        while coalescer::drain_batch(&self.ctx).await.unwrap() > 0 {}
    }

    /// Run events one at a time, applying metadata after each, until the
    /// bus is empty. Returns every worker response in dispatch order.
    pub async fn drain(&mut self) -> Vec<(Topic, WorkerResponse)> {
        let mut responses = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            let response = router::dispatch(&self.ctx, &event).await;
            responses.push((event.topic, response));
            self.seen.push(event);
            self.drain_metadata().await;
        }
        responses
    }

    pub fn count(&self, topic: Topic) -> usize {
        self.seen.iter().filter(|e| e.topic == topic).count()
    }

    pub async fn json(&self, key: &str) -> serde_json::Value {
        serde_json::from_slice(&self.store.get(key).await.unwrap()).unwrap()
    }

    pub async fn frame(&self, key: &str) -> Frame {
        Frame::from_parquet(self.store.get(key).await.unwrap()).unwrap()
    }
}

/// A count powerset with `cnt` and one string dimension.
pub fn counts(dimension: &str, rows: &[(i64, Option<&str>)]) -> Bytes {
    Frame::new(
        vec![
            Column::new("cnt", ColumnKind::Int),
            Column::new(dimension, ColumnKind::Str),
        ],
        rows.iter()
            .map(|(cnt, value)| {
                vec![
                    Cell::Int(*cnt),
                    value.map_or(Cell::Null, |v| Cell::Str(v.to_string())),
                ]
            })
            .collect(),
    )
    .to_parquet()
    .unwrap()
}

pub fn manifest(study: &str) -> Bytes {
    Bytes::from(format!(
        "study_prefix = \"{study}\"\n\n[export_config]\nexport_dir = \"/tmp/export\"\n"
    ))
}

pub fn zip_of(files: &[(&str, Bytes)]) -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

/// Stage a zip and publish it the way the staging watcher would.
pub async fn upload(
    harness: &Harness,
    study: &str,
    site: &str,
    version: &str,
    files: &[(&str, Bytes)],
) -> String {
    let key = format!("upload_staging/{study}/{site}/{version}/{study}.zip");
    harness
        .store
        .put(&key, zip_of(files), Some("application/zip"))
        .await
        .unwrap();
    harness
        .publish(Topic::ProcessUploadStaging, &key, site)
        .await;
    key
}
