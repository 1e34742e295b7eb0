//! SQL catalog and schema crawler contracts.
//!
//! The catalog answers ad-hoc SELECTs over tables named after package ids.
//! The crawler registers every aggregate and flat parquet as such a table.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cumulus_common::keys::{decode, Subbucket};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::BlobStore;

pub mod postgres;

pub use postgres::{PgCatalog, PgCrawler};

/// SQL flavour the filter templates render to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// Presto/Trino SQL as spoken by Athena
    Athena,
    Postgres,
}

impl SqlDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            SqlDialect::Athena => "athena",
            SqlDialect::Postgres => "postgres",
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SqlDialect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "athena" => Ok(SqlDialect::Athena),
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            other => anyhow::bail!("Unknown SQL dialect: {}", other),
        }
    }
}

/// Rows returned by a catalog query, values already converted to JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[async_trait]
pub trait SqlCatalog: Send + Sync + 'static {
    /// Schema holding the crawled tables.
    fn database(&self) -> &str;

    fn dialect(&self) -> SqlDialect;

    /// Every table name in [`SqlCatalog::database`].
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn query(&self, sql: &str) -> Result<QueryResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrawlerState {
    Ready,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlerStatus {
    pub state: CrawlerState,
    pub last_crawl_start: Option<DateTime<Utc>>,
}

impl CrawlerStatus {
    pub fn is_idle(&self) -> bool {
        self.state == CrawlerState::Ready
    }
}

#[async_trait]
pub trait Crawler: Send + Sync + 'static {
    async fn status(&self) -> Result<CrawlerStatus>;

    /// Start a crawl. Fails with `CrawlerBusy` while one is running.
    async fn start(&self) -> Result<()>;
}

/// A parquet the crawler registers, with the table it becomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTarget {
    pub table: String,
    pub key: String,
}

/// Every canonical aggregate and flat parquet in the bucket.
pub async fn crawl_targets(store: &dyn BlobStore) -> Result<Vec<CrawlTarget>> {
    let mut targets = Vec::new();
    for subbucket in [Subbucket::Aggregates, Subbucket::Flat] {
        for object in store.list(&subbucket.prefix()).await? {
            if !object.key.ends_with(".parquet") {
                continue;
            }
            let Ok(decoded) = decode(&object.key) else {
                tracing::warn!(key = %object.key, "Skipping non-canonical key during crawl");
                continue;
            };
            let table = match subbucket {
                Subbucket::Flat => decoded.meta.flat_package_id()?,
                _ => decoded.meta.package_id()?,
            };
            targets.push(CrawlTarget {
                table,
                key: object.key,
            });
        }
    }
    targets.sort_by(|a, b| a.table.cmp(&b.table));
    Ok(targets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("Athena".parse::<SqlDialect>().unwrap(), SqlDialect::Athena);
        assert_eq!("postgresql".parse::<SqlDialect>().unwrap(), SqlDialect::Postgres);
        assert!("sqlite".parse::<SqlDialect>().is_err());
    }

    #[test]
    fn test_crawler_state_wire_names() {
        assert_eq!(serde_json::to_string(&CrawlerState::Ready).unwrap(), "\"READY\"");
    }

    #[tokio::test]
    async fn test_crawl_targets_skip_siblings_and_junk() {
        let store = MemoryStorage::new();
        for key in [
            "aggregates/s/s__dp/s__dp__099/s__dp__aggregate.parquet",
            "aggregates/s/s__dp/s__dp__099/s__dp__aggregate.csv",
            "flat/s/site_a/s__ds__site_a__001/s__ds__site_a__flat.parquet",
            "aggregates/not/canonical.parquet",
        ] {
            store.put(key, Bytes::new(), None).await.unwrap();
        }

        let tables: Vec<_> = crawl_targets(&store)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.table)
            .collect();
        assert_eq!(tables, vec!["s__dp__099", "s__ds__site_a__001"]);
    }
}
