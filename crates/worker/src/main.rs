// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotaflow Background Worker
//!
//! Drains the billing webhook queue into the reconciliation engine and prunes
//! old queue rows.

mod webhook_processor;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quotaflow_billing::{
    HttpProviderClient, PgIdentityAdapter, PgStateRepository, ReconciliationConfig,
    ReconciliationEngine,
};
use quotaflow_shared::{create_pool, run_migrations, DEFAULT_MAX_CONNECTIONS};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Queue settings read from the environment
#[derive(Debug, Clone, Copy)]
struct WorkerConfig {
    poll_interval: Duration,
    batch_size: i64,
    retention_days: i32,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            poll_interval: Duration::from_secs(env_or("WEBHOOK_QUEUE_POLL_SECS", 5)?.max(1)),
            batch_size: env_or("WEBHOOK_QUEUE_BATCH_SIZE", 10)?,
            retention_days: env_or("WEBHOOK_QUEUE_RETENTION_DAYS", 7)?,
        })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url, DEFAULT_MAX_CONNECTIONS)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;

    let worker_config = WorkerConfig::from_env()?;
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(PgStateRepository::new(pool.clone())),
        Arc::new(HttpProviderClient::from_env()?),
        Arc::new(PgIdentityAdapter::new(pool.clone())),
        ReconciliationConfig::from_env()?,
    ));

    let mut scheduler = JobScheduler::new().await?;

    let queue_pool = pool.clone();
    let queue_engine = engine.clone();
    let queue_job = Job::new_repeated_async(worker_config.poll_interval, move |_uuid, _l| {
        let pool = queue_pool.clone();
        let engine = queue_engine.clone();
        Box::pin(async move {
            webhook_processor::process_webhook_queue(&pool, &engine, worker_config.batch_size)
                .await;
        })
    })?;
    scheduler.add(queue_job).await?;

    // Daily at 03:00 UTC
    let cleanup_pool = pool.clone();
    let cleanup_job = Job::new_async("0 0 3 * * *", move |_uuid, _l| {
        let pool = cleanup_pool.clone();
        Box::pin(async move {
            if let Err(e) =
                webhook_processor::cleanup_old_webhooks(&pool, worker_config.retention_days).await
            {
                tracing::error!(error = %e, "Failed to clean up billing webhook queue");
            }
        })
    })?;
    scheduler.add(cleanup_job).await?;

    scheduler.start().await?;

    tracing::info!(
        poll_interval_secs = worker_config.poll_interval.as_secs(),
        batch_size = worker_config.batch_size,
        "Billing worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping billing worker");

    scheduler.shutdown().await?;
    engine.meter_reporter().shutdown().await;
    pool.close().await;

    tracing::info!("Billing worker stopped");
    Ok(())
}
