//! Postgres-backed queue, catalog and crawler.
//!
//! These run only when `DATABASE_URL` points at a scratch database.

#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use cumulus_common::CumulusError;
use cumulus_server::catalog::{Crawler, CrawlerState, PgCatalog, PgCrawler, SqlCatalog};
use cumulus_server::features::chart_data::query::{chart_data, ChartRequest};
use cumulus_server::messaging::queue::{PgQueue, WorkQueue};
use cumulus_server::messaging::{LocalBus, Topic};
use cumulus_server::pipeline::frame::{Cell, Column, ColumnKind, Frame};
use cumulus_server::storage::{BlobStore, MemoryStorage};
use serde_json::json;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "cumulus_test";
const AGGREGATE: &str = "aggregates/core/core__count/core__count__099/core__count__aggregate";

async fn pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .unwrap();
    sqlx::migrate!("../../migrations").run(&pool).await.unwrap();
    Some(pool)
}

fn aggregate() -> Frame {
    let row = |cnt: i64, sex: Option<&str>, age: Option<i64>| {
        vec![
            Cell::Int(cnt),
            sex.map_or(Cell::Null, |s| Cell::Str(s.to_string())),
            age.map_or(Cell::Null, Cell::Int),
        ]
    };
    Frame::new(
        vec![
            Column::new("cnt", ColumnKind::Int),
            Column::new("sex", ColumnKind::Str),
            Column::new("age", ColumnKind::Int),
        ],
        vec![
            row(18, None, None),
            row(13, Some("M"), None),
            row(5, Some("F"), None),
            row(10, Some("M"), Some(30)),
        ],
    )
}

#[tokio::test]
#[serial]
async fn test_pg_queue_holds_group_while_in_flight() {
    let Some(pool) = pool().await else { return };
    sqlx::query("DELETE FROM metadata_queue").execute(&pool).await.unwrap();
    let queue = PgQueue::new(pool);
    let visibility = Duration::from_secs(30);

    queue.send("cumulus", "first").await.unwrap();
    queue.send("cumulus", "second").await.unwrap();

    let batch = queue.receive(10, visibility).await.unwrap();
    assert_eq!(
        batch.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
        vec!["first", "second"]
    );

    queue.send("cumulus", "third").await.unwrap();
    assert!(queue.receive(10, visibility).await.unwrap().is_empty());

    for message in &batch {
        queue.delete(&message.receipt).await.unwrap();
    }
    let next = queue.receive(10, visibility).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].body, "third");
    queue.delete(&next[0].receipt).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_crawl_then_chart_query() {
    let Some(pool) = pool().await else { return };
    let store = Arc::new(MemoryStorage::new());
    store
        .put(
            &format!("{AGGREGATE}.parquet"),
            aggregate().to_parquet().unwrap(),
            None,
        )
        .await
        .unwrap();
    store
        .put(
            &format!("{AGGREGATE}.csv"),
            Bytes::from_static(b"cnt,sex,age\n"),
            Some("text/csv"),
        )
        .await
        .unwrap();

    let (bus, mut events) = LocalBus::new();
    let crawler = PgCrawler::new(pool.clone(), SCHEMA, store.clone(), Arc::new(bus));
    assert_eq!(crawler.crawl().await.unwrap(), 1);
    assert_eq!(events.try_recv().unwrap().topic, Topic::CacheApi);
    assert_eq!(crawler.status().await.unwrap().state, CrawlerState::Ready);

    let catalog = PgCatalog::new(pool, SCHEMA);
    assert!(catalog
        .list_tables()
        .await
        .unwrap()
        .contains(&"core__count__099".to_string()));

    let mut request = ChartRequest {
        column: "sex".into(),
        ..Default::default()
    };
    let body = serde_json::to_value(
        chart_data(store.as_ref(), &catalog, "core__count__099", &request)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(body["data"][0]["rows"], json!([["F", 5], ["M", 13]]));
    assert_eq!(body["totalCount"], json!(18));

    request.filters = vec!["age:gte:18".into()];
    let body = serde_json::to_value(
        chart_data(store.as_ref(), &catalog, "core__count__099", &request)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(body["data"][0]["rows"], json!([["M", 10]]));

    request.filters = vec!["sex:strEqCI:m".into()];
    let body = serde_json::to_value(
        chart_data(store.as_ref(), &catalog, "core__count__099", &request)
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(body["rowCount"], json!(1));
    assert_eq!(body["totalCount"], json!(13));
}

#[tokio::test]
#[serial]
async fn test_crawler_rejects_overlapping_start() {
    let Some(pool) = pool().await else { return };
    let store = Arc::new(MemoryStorage::new());
    let (bus, _events) = LocalBus::new();
    let crawler = PgCrawler::new(pool, SCHEMA, store, Arc::new(bus));

    // The spawned crawl cannot run before the next await on a
    // current-thread runtime.
    crawler.start().await.unwrap();
    let error = crawler.start().await.unwrap_err();
    assert!(matches!(
        error.downcast_ref::<CumulusError>(),
        Some(CumulusError::CrawlerBusy(_))
    ));
    let status = crawler.status().await.unwrap();
    assert_eq!(status.state, CrawlerState::Running);
    assert!(status.last_crawl_start.is_some());
}
