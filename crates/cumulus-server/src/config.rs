//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::storage::config::StorageConfig;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/cumulus";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Pipeline Constants
// ============================================================================

/// Schema holding crawled tables.
pub const DEFAULT_CATALOG_DATABASE: &str = "cumulus";

/// Interval between scans of `upload_staging/` and stale transactions.
pub const DEFAULT_STAGING_POLL_SECS: u64 = 30;

/// Metadata deltas applied per coalescer batch.
pub const DEFAULT_COALESCER_BATCH_SIZE: usize = 10;

/// Upper bound imposed by the FIFO queue contract.
pub const MAX_COALESCER_BATCH_SIZE: usize = 10;

/// Seconds a received queue message stays invisible.
pub const DEFAULT_QUEUE_VISIBILITY_SECS: u64 = 120;

pub const DEFAULT_CRAWLER_POLL_ATTEMPTS: u32 = 10;
pub const DEFAULT_CRAWLER_POLL_SECS: u64 = 60;

/// Largest accepted gap between an upload and its processed artifacts.
pub const DEFAULT_COMPLETENESS_WINDOW_SECS: u64 = 300;

/// Age after which an unfinished upload transaction is dropped.
pub const DEFAULT_STALE_TRANSACTION_HOURS: i64 = 24;

pub const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 600;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub pipeline: PipelineConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// SQL catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Schema the crawler loads tables into
    pub database: String,
}

/// Timers, batch sizes and windows used by the pipeline workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub staging_poll_secs: u64,
    pub coalescer_batch_size: usize,
    pub queue_visibility_secs: u64,
    pub crawler_poll_attempts: u32,
    pub crawler_poll_secs: u64,
    pub completeness_window_secs: u64,
    pub stale_transaction_hours: i64,
    pub presign_expiry_secs: u64,
}

impl PipelineConfig {
    pub fn staging_poll_interval(&self) -> Duration {
        Duration::from_secs(self.staging_poll_secs)
    }

    pub fn queue_visibility(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_secs)
    }

    pub fn crawler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.crawler_poll_secs)
    }

    pub fn completeness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completeness_window_secs as i64)
    }

    pub fn stale_transaction_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_transaction_hours)
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staging_poll_secs: DEFAULT_STAGING_POLL_SECS,
            coalescer_batch_size: DEFAULT_COALESCER_BATCH_SIZE,
            queue_visibility_secs: DEFAULT_QUEUE_VISIBILITY_SECS,
            crawler_poll_attempts: DEFAULT_CRAWLER_POLL_ATTEMPTS,
            crawler_poll_secs: DEFAULT_CRAWLER_POLL_SECS,
            completeness_window_secs: DEFAULT_COMPLETENESS_WINDOW_SECS,
            stale_transaction_hours: DEFAULT_STALE_TRANSACTION_HOURS,
            presign_expiry_secs: DEFAULT_PRESIGN_EXPIRY_SECS,
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or unparsable.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server: ServerConfig {
                host: std::env::var("CUMULUS_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_or("CUMULUS_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "CUMULUS_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true),
            },
            storage: StorageConfig::from_env()?,
            catalog: CatalogConfig {
                database: std::env::var("CUMULUS_DATABASE")
                    .unwrap_or_else(|_| DEFAULT_CATALOG_DATABASE.to_string()),
            },
            pipeline: PipelineConfig {
                staging_poll_secs: env_or("CUMULUS_STAGING_POLL_SECS", DEFAULT_STAGING_POLL_SECS),
                coalescer_batch_size: env_or(
                    "CUMULUS_COALESCER_BATCH_SIZE",
                    DEFAULT_COALESCER_BATCH_SIZE,
                ),
                queue_visibility_secs: env_or(
                    "CUMULUS_QUEUE_VISIBILITY_SECS",
                    DEFAULT_QUEUE_VISIBILITY_SECS,
                ),
                crawler_poll_attempts: env_or(
                    "CUMULUS_CRAWLER_POLL_ATTEMPTS",
                    DEFAULT_CRAWLER_POLL_ATTEMPTS,
                ),
                crawler_poll_secs: env_or("CUMULUS_CRAWLER_POLL_SECS", DEFAULT_CRAWLER_POLL_SECS),
                completeness_window_secs: env_or(
                    "CUMULUS_COMPLETENESS_WINDOW_SECS",
                    DEFAULT_COMPLETENESS_WINDOW_SECS,
                ),
                stale_transaction_hours: env_or(
                    "CUMULUS_STALE_TRANSACTION_HOURS",
                    DEFAULT_STALE_TRANSACTION_HOURS,
                ),
                presign_expiry_secs: env_or(
                    "CUMULUS_PRESIGN_EXPIRY_SECS",
                    DEFAULT_PRESIGN_EXPIRY_SECS,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.storage.bucket.is_empty() {
            anyhow::bail!("S3 bucket cannot be empty");
        }

        if self.catalog.database.is_empty() || self.catalog.database.contains('"') {
            anyhow::bail!("Invalid catalog database name: {:?}", self.catalog.database);
        }

        let batch = self.pipeline.coalescer_batch_size;
        if batch == 0 || batch > MAX_COALESCER_BATCH_SIZE {
            anyhow::bail!(
                "Coalescer batch size must be between 1 and {} (got {})",
                MAX_COALESCER_BATCH_SIZE,
                batch
            );
        }

        if self.pipeline.crawler_poll_attempts == 0 {
            anyhow::bail!("Crawler poll attempts must be greater than 0");
        }

        if self.pipeline.staging_poll_secs == 0 {
            anyhow::bail!("Staging poll interval must be greater than 0");
        }

        if self.pipeline.stale_transaction_hours <= 0 {
            anyhow::bail!("Stale transaction horizon must be positive");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
            storage: StorageConfig::for_minio("http://localhost:9000", "cumulus-aggregator"),
            catalog: CatalogConfig {
                database: DEFAULT_CATALOG_DATABASE.to_string(),
            },
            pipeline: PipelineConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_batch_size_is_bounded() {
        let mut config = Config::default();
        config.pipeline.coalescer_batch_size = 11;
        assert!(config.validate().is_err());
        config.pipeline.coalescer_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_catalog_name_cannot_break_quoting() {
        let mut config = Config::default();
        config.catalog.database = "cumulus\"; drop".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_reads_environment() {
        std::env::set_var("CUMULUS_PORT", "9100");
        std::env::set_var("CUMULUS_DATABASE", "dashboard");
        std::env::set_var("CUMULUS_CRAWLER_POLL_ATTEMPTS", "3");

        let config = Config::load().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.catalog.database, "dashboard");
        assert_eq!(config.pipeline.crawler_poll_attempts, 3);

        std::env::remove_var("CUMULUS_PORT");
        std::env::remove_var("CUMULUS_DATABASE");
        std::env::remove_var("CUMULUS_CRAWLER_POLL_ATTEMPTS");
    }

    #[test]
    #[serial]
    fn test_load_rejects_oversized_batch() {
        std::env::set_var("CUMULUS_COALESCER_BATCH_SIZE", "25");
        assert!(Config::load().is_err());
        std::env::remove_var("CUMULUS_COALESCER_BATCH_SIZE");
    }
}
