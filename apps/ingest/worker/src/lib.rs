//! Ingest Worker Service
//!
//! Drains the ingestion queue and hands each task to the ingestion service.
//!
//! ## Architecture
//!
//! ```text
//! Redis lanes ({prefix}:lane:priority, {prefix}:lane:normal)
//!   ↓ (QueueManager::dequeue, WORKER_CONCURRENCY loops)
//! Worker<HttpProcessor>
//!   ↓ POST INGEST_PROCESSOR_URL
//! Ingestion service
//!   ↓
//! ack / fail → status records, dead letters, {prefix}:events
//! ```

pub mod processor;

use axum::Router;
use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv, env_parse};
use eyre::{Result, WrapErr};
use processor::{HttpProcessor, HttpProcessorConfig};
use std::sync::Arc;
use task_queue::{
    ConnectRetry, HealthState, KeySpace, QueueConfig, QueueManager, RedisEventStream, Worker,
    WorkerConfig, connect_with_retry, full_admin_router, metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Start the health and admin HTTP server
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = full_admin_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the ingest worker
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Loads queue, worker and processor configuration
/// 3. Connects to Redis with retry
/// 4. Runs `WORKER_CONCURRENCY` worker loops until SIGINT/SIGTERM
///
/// # Errors
///
/// Returns an error if configuration is invalid or Redis is unreachable at
/// startup. Broker outages after startup are ridden out by the workers.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = %app_name, version = %app_version, "Starting ingest worker service");
    info!("Environment: {:?}", environment);

    let health_port: u16 = env_parse("HEALTH_PORT", 8082).wrap_err("Invalid HEALTH_PORT")?;

    let queue_config = QueueConfig::from_env().wrap_err("Failed to load queue configuration")?;
    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let processor_config =
        HttpProcessorConfig::from_env().wrap_err("Failed to load processor configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!(
        queue = %queue_config.key_prefix,
        priority_threshold = queue_config.priority_threshold,
        max_retries = queue_config.default_max_retries,
        concurrency = worker_config.concurrency,
        processor_url = %processor_config.url,
        "Worker configuration loaded"
    );

    info!("Connecting to Redis...");
    let redis = connect_with_retry(&redis_config, &ConnectRetry::default())
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let events = RedisEventStream::new(redis.clone(), &KeySpace::new(&queue_config.key_prefix));
    let manager = Arc::new(QueueManager::redis(redis, queue_config).with_events(Arc::new(events)));

    let processor = Arc::new(
        HttpProcessor::new(processor_config).wrap_err("Failed to build processor HTTP client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(manager.clone(), app_name, app_version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut workers = JoinSet::new();
    for index in 0..worker_config.concurrency.max(1) {
        let config = worker_config
            .clone()
            .with_worker_id(format!("{}-{}", worker_config.worker_id, index));
        let worker = Worker::with_arc_processor(manager.clone(), processor.clone(), config);
        let shutdown = shutdown_rx.clone();
        workers.spawn(async move { worker.run(shutdown).await });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker exited with error"),
            Err(e) => error!(error = %e, "Worker task panicked"),
        }
    }

    info!("Ingest worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        sigterm.recv().await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
