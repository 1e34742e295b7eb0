//! Cumulus Server - Main entry point

use anyhow::Result;
use cumulus_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tracing::info;

use cumulus_server::{
    catalog::{PgCatalog, PgCrawler},
    config::Config,
    features,
    messaging::{queue::PgQueue, LocalBus},
    pipeline::{
        coalescer::MetadataCoalescer, completeness::ClaimLocks, janitor::StagingWatcher,
        router::EventRouter, PipelineContext,
    },
    storage::S3Storage,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("cumulus-server")
        .filter_directives("cumulus_server=debug,tower_http=debug,sqlx=info")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting Cumulus Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    let store = Arc::new(S3Storage::new(config.storage.clone()).await?);
    info!(bucket = %config.storage.bucket, "Storage client initialized");

    let (bus, events) = LocalBus::new();
    let publisher = Arc::new(bus);
    let catalog = Arc::new(PgCatalog::new(db_pool.clone(), &config.catalog.database));
    let crawler = Arc::new(PgCrawler::new(
        db_pool.clone(),
        &config.catalog.database,
        store.clone(),
        publisher.clone(),
    ));

    let ctx = PipelineContext {
        store: store.clone(),
        publisher,
        queue: Arc::new(PgQueue::new(db_pool)),
        catalog: catalog.clone(),
        crawler,
        config: config.pipeline.clone(),
        claims: ClaimLocks::new(),
    };

    let _router = EventRouter::new(ctx.clone(), events).start();
    let _coalescer = MetadataCoalescer::new(ctx.clone()).start();
    let _watcher = StagingWatcher::new(ctx).start();
    info!("Pipeline workers started");

    let state = features::FeatureState {
        store,
        catalog,
        presign_expiry: config.pipeline.presign_expiry(),
    };
    let app = cumulus_server::router(state, &config.cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
