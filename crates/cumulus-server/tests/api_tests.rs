//! HTTP surface exercised through the full router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use common::{counts, MemoryCatalog};
use cumulus_common::metadata::{COLUMN_TYPES_KEY, DATA_PACKAGES_KEY, STUDY_PERIODS_KEY};
use cumulus_server::catalog::QueryResult;
use cumulus_server::config::CorsConfig;
use cumulus_server::features::uploads::{AUTH_KEY, SITE_METADATA_KEY};
use cumulus_server::features::FeatureState;
use cumulus_server::pipeline::UNEXPECTED_ERROR_BODY;
use cumulus_server::storage::{write_json, BlobStore, MemoryStorage};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const AGGREGATE_DIR: &str = "aggregates/core/core__count/core__count__099/";

struct Api {
    app: Router,
    store: Arc<MemoryStorage>,
    catalog: Arc<MemoryCatalog>,
}

async fn api() -> Api {
    let store = Arc::new(MemoryStorage::new());
    let catalog = Arc::new(MemoryCatalog::default());
    let state = FeatureState {
        store: store.clone(),
        catalog: catalog.clone(),
        presign_expiry: Duration::from_secs(600),
    };
    let cors = CorsConfig {
        allowed_origins: vec!["*".to_string()],
        allow_credentials: false,
    };

    store
        .put(
            &format!("{AGGREGATE_DIR}core__count__aggregate.csv"),
            Bytes::from_static(b"cnt,sex,age,site\n18,,,\n"),
            Some("text/csv"),
        )
        .await
        .unwrap();
    store
        .put(
            &format!("{AGGREGATE_DIR}core__count__aggregate.parquet"),
            counts("sex", &[(18, None), (13, Some("M"))]),
            None,
        )
        .await
        .unwrap();
    write_json(
        store.as_ref(),
        COLUMN_TYPES_KEY,
        &json!({"core": {"count": {"core__count__099": {
            "column_types_format_version": 2,
            "columns": {"cnt": "integer", "sex": "string", "age": "integer", "site": "string"}
        }}}}),
    )
    .await
    .unwrap();
    write_json(
        store.as_ref(),
        DATA_PACKAGES_KEY,
        &json!([{
            "id": "core__count__099",
            "study": "core",
            "name": "count",
            "version": "099",
            "columns": {"cnt": "integer", "sex": "string"},
            "total": 18,
            "last_data_update": null,
            "s3_path": null
        }]),
    )
    .await
    .unwrap();

    Api {
        app: cumulus_server::router(state, &cors),
        store,
        catalog,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

fn json_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_data_packages_listing_and_lookup() {
    let api = api().await;

    let (status, _, body) = get(&api.app, "/data-packages").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body).as_array().unwrap().len(), 1);

    let (_, _, body) = get(&api.app, "/data-packages?name=other").await;
    assert!(json_body(&body).as_array().unwrap().is_empty());

    let (status, _, body) = get(&api.app, "/data-packages/core__count__099").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["total"], json!(18));

    let (status, _, _) = get(&api.app, "/data-packages/core__missing__099").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chart_data_query() {
    let api = api().await;
    api.catalog.respond_with(QueryResult {
        columns: vec!["sex".into(), "cnt".into()],
        rows: vec![vec![json!("F"), json!(5)], vec![json!("M"), json!(13)]],
    });

    let (status, _, body) = get(
        &api.app,
        "/chart-data/core__count__099?column=sex&filter=age:gte:18&filter=sex:strEq:none",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["column"], json!("sex"));
    assert_eq!(body["rowCount"], json!(2));
    assert_eq!(body["totalCount"], json!(18));
    assert_eq!(body["filters"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["rows"], json!([["F", 5], ["M", 13]]));

    let sql = api.catalog.queries().pop().unwrap();
    assert!(sql.contains("FROM \"cumulus\".\"core__count__099\""));
    assert!(sql.contains("\"site\" IS NULL"));
    assert!(!sql.contains("\"age\" IS NULL"));
    assert!(sql.contains("'cumulus__none'"));
}

#[tokio::test]
async fn test_chart_data_failures() {
    let api = api().await;

    let (status, _, body) = get(&api.app, "/chart-data/core__count__099?column=sex&filter=sex:bogus:x").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(&body)["error"]["message"], json!(UNEXPECTED_ERROR_BODY));
    assert!(api.catalog.queries().is_empty());

    let (status, _, _) = get(&api.app, "/chart-data/core__count__099?column=weight").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = get(&api.app, "/chart-data/core__none__099?column=sex").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_csv_redirect_carries_column_headers() {
    let api = api().await;

    let (status, headers, _) = get(&api.app, &format!("/{AGGREGATE_DIR}core__count__aggregate.csv")).await;
    assert_eq!(status, StatusCode::FOUND);
    let location = headers[header::LOCATION].to_str().unwrap();
    assert!(location.contains("core__count__aggregate.csv"));
    assert!(location.contains("text/csv"));
    assert_eq!(headers["x-column-names"], "cnt,sex,age,site");
    assert_eq!(headers["x-column-types"], "integer,string,integer,string");

    let (status, _, _) = get(&api.app, "/aggregates/core/core__count/core__count__099/nope.csv").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = get(&api.app, "/aggregates").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body).as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_from_parquet_conversion() {
    let api = api().await;
    let path = format!("{AGGREGATE_DIR}core__count__aggregate.parquet");

    let (status, headers, body) = get(&api.app, &format!("/from-parquet?s3_path={path}&type=tsv")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/tab-separated-values");
    assert_eq!(std::str::from_utf8(&body).unwrap(), "cnt\tsex\n18\t\n13\tM\n");

    let (_, _, body) = get(&api.app, &format!("/from-parquet?s3_path={path}&type=json")).await;
    assert_eq!(json_body(&body)[1], json!({"cnt": 13, "sex": "M"}));

    let (status, _, _) = get(&api.app, "/from-parquet?s3_path=admin/auth.json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_study_periods() {
    let api = api().await;
    write_json(
        api.store.as_ref(),
        STUDY_PERIODS_KEY,
        &json!({"site_a": {"core": {"core__099": {"earliest_date": "2020-01-01"}}}}),
    )
    .await
    .unwrap();

    let (status, _, body) = get(&api.app, "/study-periods/site_a/core").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["core__099"]["earliest_date"], json!("2020-01-01"));

    let (status, _, _) = get(&api.app, "/study-periods/site_b").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_urls_require_known_site() {
    let api = api().await;
    let token = STANDARD.encode("general:hospital");
    write_json(api.store.as_ref(), AUTH_KEY, &json!({ token.clone(): {"site": "general"} }))
        .await
        .unwrap();
    write_json(
        api.store.as_ref(),
        SITE_METADATA_KEY,
        &json!({"general": {"path": "general_hospital"}}),
    )
    .await
    .unwrap();

    let request = |auth: Option<String>, body: &str| {
        let mut builder = Request::post("/upload-urls").header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    };
    let valid = r#"{"study": "core", "filename": "core.zip", "version": "99"}"#;

    let (status, _, _) = send(&api.app, request(None, valid)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let stranger = format!("Basic {}", STANDARD.encode("who:me"));
    let (status, _, _) = send(&api.app, request(Some(stranger), valid)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(&api.app, request(Some(format!("Basic {token}")), "{\"study\": 1}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&api.app, request(Some(format!("Basic {token}")), valid)).await;
    assert_eq!(status, StatusCode::OK);
    let body = json_body(&body);
    assert_eq!(body["key"], json!("upload_staging/core/general_hospital/099/core.zip"));
    assert_eq!(body["method"], json!("PUT"));
    assert_eq!(body["expires_in"], json!(600));
}

#[tokio::test]
async fn test_static_and_health() {
    let api = api().await;
    api.store
        .put("static/dashboard.json", Bytes::from_static(b"{}"), None)
        .await
        .unwrap();

    let (status, headers, body) = get(&api.app, "/static/dashboard.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(&body[..], b"{}");

    let (status, _, _) = get(&api.app, "/static/missing.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = get(&api.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["status"], json!("healthy"));
}
