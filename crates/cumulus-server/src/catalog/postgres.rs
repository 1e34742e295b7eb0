//! Postgres-backed SQL catalog and crawler.
//!
//! The crawler materialises each aggregate and flat parquet into a table
//! named after its package id inside the catalog schema.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use cumulus_common::CumulusError;
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{Column, PgPool, Postgres, QueryBuilder, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use super::{
    crawl_targets, CrawlTarget, Crawler, CrawlerState, CrawlerStatus, QueryResult, SqlCatalog,
    SqlDialect,
};
use crate::messaging::{Publisher, Topic, DATA_PACKAGES_SUBJECT};
use crate::pipeline::frame::{Cell, ColumnKind, Frame};
use crate::storage::BlobStore;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 60_000;

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
    database: String,
}

impl PgCatalog {
    pub fn new(pool: PgPool, database: impl Into<String>) -> Self {
        Self {
            pool,
            database: database.into(),
        }
    }
}

#[async_trait]
impl SqlCatalog for PgCatalog {
    fn database(&self) -> &str {
        &self.database
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    #[instrument(skip(self), fields(database = %self.database))]
    async fn list_tables(&self) -> Result<Vec<String>> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::TEXT FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(&self.database)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list catalog tables")?;
        Ok(tables)
    }

    #[instrument(skip(self, sql))]
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "Running catalog query");
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .context("Catalog query failed")?;

        let Some(first) = rows.first() else {
            return Ok(QueryResult::default());
        };
        let columns = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let mut result_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut json_row = Vec::with_capacity(row.len());
            for (idx, column) in row.columns().iter().enumerate() {
                json_row.push(postgres_value_to_json(row, idx, column.type_info().name())?);
            }
            result_rows.push(json_row);
        }

        Ok(QueryResult {
            columns,
            rows: result_rows,
        })
    }
}

fn postgres_value_to_json(row: &PgRow, idx: usize, type_name: &str) -> Result<serde_json::Value> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(serde_json::Value::Null);
    }

    let value = match type_name {
        "BOOL" => serde_json::Value::Bool(row.try_get(idx)?),
        "INT2" => serde_json::json!(row.try_get::<i16, _>(idx)?),
        "INT4" => serde_json::json!(row.try_get::<i32, _>(idx)?),
        "INT8" => serde_json::json!(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => serde_json::json!(row.try_get::<f32, _>(idx)?),
        "FLOAT8" => serde_json::json!(row.try_get::<f64, _>(idx)?),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            serde_json::Value::String(row.try_get(idx)?)
        }
        "DATE" => {
            let v: chrono::NaiveDate = row.try_get(idx)?;
            serde_json::Value::String(v.to_string())
        }
        "TIMESTAMP" => {
            let v: chrono::NaiveDateTime = row.try_get(idx)?;
            serde_json::Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        "TIMESTAMPTZ" => {
            let v: chrono::DateTime<Utc> = row.try_get(idx)?;
            serde_json::Value::String(v.to_rfc3339())
        }
        _ => {
            let v: String = row
                .try_get(idx)
                .unwrap_or_else(|_| format!("<{}>", type_name));
            serde_json::Value::String(v)
        }
    };

    Ok(value)
}

/// Loads every aggregate and flat parquet into the catalog schema.
#[derive(Clone)]
pub struct PgCrawler {
    pool: PgPool,
    database: String,
    store: Arc<dyn BlobStore>,
    publisher: Arc<dyn Publisher>,
    status: Arc<Mutex<CrawlerStatus>>,
}

impl PgCrawler {
    pub fn new(
        pool: PgPool,
        database: impl Into<String>,
        store: Arc<dyn BlobStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            pool,
            database: database.into(),
            store,
            publisher,
            status: Arc::new(Mutex::new(CrawlerStatus {
                state: CrawlerState::Ready,
                last_crawl_start: None,
            })),
        }
    }

    /// Crawl in the foreground, then publish `cache-api`.
    #[instrument(skip(self), fields(database = %self.database))]
    pub async fn crawl(&self) -> Result<usize> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.database)
        ))
        .execute(&self.pool)
        .await
        .context("Failed to create catalog schema")?;

        let targets = crawl_targets(self.store.as_ref()).await?;
        for target in &targets {
            self.load_table(target).await?;
        }
        info!(tables = targets.len(), "Crawl finished");

        self.publisher
            .publish(Topic::CacheApi, "", DATA_PACKAGES_SUBJECT)
            .await?;
        Ok(targets.len())
    }

    async fn load_table(&self, target: &CrawlTarget) -> Result<()> {
        let data = self.store.get(&target.key).await?;
        let frame = Frame::from_parquet(data)
            .with_context(|| format!("Failed to read {}", target.key))?;
        let qualified = format!(
            "{}.{}",
            quote_ident(&self.database),
            quote_ident(&target.table)
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {qualified}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(&qualified, &frame))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create {qualified}"))?;

        let column_list = frame
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let kinds: Vec<ColumnKind> = frame.columns.iter().map(|c| c.kind).collect();
        let rows_per_insert = (MAX_BIND_PARAMS / kinds.len().max(1)).max(1);

        for chunk in frame.rows.chunks(rows_per_insert) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {qualified} ({column_list}) "));
            builder.push_values(chunk, |mut values, row| {
                for (cell, kind) in row.iter().zip(&kinds) {
                    bind_cell(&mut values, cell, *kind);
                }
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(table = %target.table, rows = frame.len(), "Loaded table");
        Ok(())
    }
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Int => "BIGINT",
        ColumnKind::Float => "DOUBLE PRECISION",
        ColumnKind::Bool => "BOOLEAN",
        ColumnKind::Str => "TEXT",
        ColumnKind::Date => "DATE",
        ColumnKind::Timestamp => "TIMESTAMP",
    }
}

fn create_table_sql(qualified: &str, frame: &Frame) -> String {
    let columns = frame
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {qualified} ({columns})")
}

/// Bind with the column's SQL type so NULLs are typed correctly.
fn bind_cell(values: &mut Separated<'_, '_, Postgres, &'static str>, cell: &Cell, kind: ColumnKind) {
    match kind {
        ColumnKind::Int => values.push_bind(match cell {
            Cell::Int(v) => Some(*v),
            _ => None,
        }),
        ColumnKind::Float => values.push_bind(cell.as_f64()),
        ColumnKind::Bool => values.push_bind(match cell {
            Cell::Bool(v) => Some(*v),
            _ => None,
        }),
        ColumnKind::Str => values.push_bind(cell.render()),
        ColumnKind::Date => values.push_bind(cell.as_date()),
        ColumnKind::Timestamp => values.push_bind(cell.as_datetime()),
    };
}

#[async_trait]
impl Crawler for PgCrawler {
    async fn status(&self) -> Result<CrawlerStatus> {
        Ok(self.status.lock().await.clone())
    }

    async fn start(&self) -> Result<()> {
        {
            let mut status = self.status.lock().await;
            if status.state != CrawlerState::Ready {
                return Err(anyhow!(CumulusError::CrawlerBusy(self.database.clone())));
            }
            status.state = CrawlerState::Running;
            status.last_crawl_start = Some(Utc::now());
        }

        let crawler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = crawler.crawl().await {
                error!(error = %e, "Crawl failed");
            }
            crawler.status.lock().await.state = CrawlerState::Ready;
        });
        Ok(())
    }
}
