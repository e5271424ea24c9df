use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use fhirq_jobs::{
    EngineConfig, InMemoryJobStore, JobStore, PostgresJobStore, QueueLimits, StaleLeaseReporter,
    WorkerHost,
};

mod shutdown;

const DEFAULT_POOL_SIZE: u32 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fhirq_observability::init();

    let config = EngineConfig::load().context("failed to load engine configuration")?;
    let store = build_store(&config).await?;

    let name = std::env::var("FHIRQ_HOST_NAME")
        .unwrap_or_else(|_| format!("fhirq-worker-{}", std::process::id()));
    let mut host = WorkerHost::new(store, config.clone()).with_name(name);
    host.register_watchdog(StaleLeaseReporter::from_config(&config));

    let handle = host.spawn();
    shutdown::install_shutdown_handler(handle.shutdown_token())
        .context("failed to install signal handlers")?;

    let report = handle.run_until_shutdown().await;
    if !report.drained {
        tracing::warn!(
            abandoned = report.abandoned,
            "exiting with in-flight jobs; their leases will expire and be reclaimed"
        );
    }
    Ok(())
}

async fn build_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let limits: Arc<dyn QueueLimits> = Arc::new(config.clone());

    let Ok(url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set; using the in-memory job store (not durable, single process)");
        return Ok(Arc::new(InMemoryJobStore::new(limits)));
    };

    let pool_size = std::env::var("FHIRQ_DB_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_POOL_SIZE);
    let pool = PgPoolOptions::new()
        .max_connections(pool_size)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool, limits);
    store
        .ensure_schema()
        .await
        .context("failed to bootstrap job schema")?;
    tracing::info!(pool_size, "using the Postgres job store");
    Ok(Arc::new(store))
}
