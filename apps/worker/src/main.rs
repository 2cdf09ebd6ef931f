//! Fleetward coordination worker runtime.

#![forbid(unsafe_code)]

mod worker_config;

use std::sync::Arc;
use std::time::Duration;

use fleetward_application::{
    Clock, ConcurrencyGate, Coordinator, CoordinatorStores, DocumentStore, DocumentWorkQueue,
    LeaseManager, MonitorCache, WorkQueueConfig, WorkerPool,
};
use fleetward_core::{AppError, AppResult, HolderId};
use fleetward_domain::{BucketAssignment, HolderRegistration, WorkItem, WorkItemState};
use fleetward_infrastructure::{
    HttpWorkItemHandler, InMemoryDocumentStore, LoggingItemMonitor, PostgresDocumentStore,
    SystemClock,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::worker_config::WorkerConfig;

const HANDLER_MAX_ATTEMPTS: u8 = 3;
const HANDLER_RETRY_BACKOFF_MS: u64 = 500;

struct Stores {
    items: Arc<dyn DocumentStore<WorkItem>>,
    registrations: Arc<dyn DocumentStore<HolderRegistration>>,
    assignments: Arc<dyn DocumentStore<BucketAssignment>>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let holder_id = HolderId::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = build_stores(&config, clock.clone()).await?;

    let gate = Arc::new(ConcurrencyGate::new(config.max_concurrency)?);
    let pool = build_worker_pool(
        &config,
        holder_id,
        &stores,
        Arc::clone(&gate),
        clock.clone(),
    )?;
    let cache = Arc::new(MonitorCache::new(
        Arc::new(LoggingItemMonitor::new()),
        clock.clone(),
        config.monitor_config(),
    )?);
    let coordinator = Arc::new(Coordinator::new(
        holder_id,
        config.coordinator_config(),
        CoordinatorStores {
            registrations: stores.registrations,
            assignments: stores.assignments,
            items: stores.items,
        },
        cache,
        clock,
    )?);

    info!(
        holder_id = %holder_id,
        handler_url = %config.handler_url,
        max_concurrency = config.max_concurrency,
        lease_seconds = config.lease_seconds,
        persistent = config.database_url.is_some(),
        "fleetward-worker started"
    );

    let stop = CancellationToken::new();
    let pool_task = tokio::spawn({
        let stop = stop.clone();
        async move { pool.run(stop).await }
    });
    let coordinator_task = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let stop = stop.clone();
        async move { coordinator.run(stop).await }
    });

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
    }
    info!(holder_id = %holder_id, "shutdown requested, draining in-flight work");
    stop.cancel();

    let (pool_result, coordinator_result) = tokio::join!(pool_task, coordinator_task);
    if let Err(error) = pool_result {
        warn!(error = %error, "worker pool task ended abnormally");
    }
    if let Err(error) = coordinator_result {
        warn!(error = %error, "coordinator task ended abnormally");
    }
    gate.wait_idle().await;

    info!(holder_id = %holder_id, "fleetward-worker stopped");
    Ok(())
}

async fn build_stores(config: &WorkerConfig, clock: Arc<dyn Clock>) -> AppResult<Stores> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, using process-local in-memory store");
        return Ok(Stores {
            items: Arc::new(InMemoryDocumentStore::new(clock.clone())),
            registrations: Arc::new(InMemoryDocumentStore::new(clock.clone())),
            assignments: Arc::new(InMemoryDocumentStore::new(clock)),
        });
    };

    let pool = connect_and_migrate(database_url).await?;
    Ok(Stores {
        items: Arc::new(PostgresDocumentStore::new(pool.clone(), "work_items")),
        registrations: Arc::new(PostgresDocumentStore::new(
            pool.clone(),
            "holder_registrations",
        )),
        assignments: Arc::new(PostgresDocumentStore::new(pool, "bucket_assignments")),
    })
}

async fn connect_and_migrate(database_url: &str) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Store(format!("failed to connect to database: {error}")))?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    Ok(pool)
}

fn build_worker_pool(
    config: &WorkerConfig,
    holder_id: HolderId,
    stores: &Stores,
    gate: Arc<ConcurrencyGate>,
    clock: Arc<dyn Clock>,
) -> AppResult<WorkerPool> {
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;
    let handler = Arc::new(HttpWorkItemHandler::new(
        http_client,
        config.handler_url.as_str(),
        HANDLER_MAX_ATTEMPTS,
        HANDLER_RETRY_BACKOFF_MS,
    ));

    let leases = LeaseManager::new(stores.items.clone(), holder_id, config.lease_seconds);
    let provisioning = DocumentWorkQueue::new(
        WorkQueueConfig {
            claimable_states: vec![WorkItemState::Pending, WorkItemState::Active],
            ..WorkQueueConfig::new("provisioning")
        },
        leases.clone(),
    )?;
    let teardown = DocumentWorkQueue::new(
        WorkQueueConfig {
            claimable_states: vec![WorkItemState::Deleting],
            ..WorkQueueConfig::new("teardown")
        },
        leases,
    )?;

    Ok(WorkerPool::new(config.pool_config(), gate, clock)?
        .with_queue(Arc::new(provisioning), handler.clone())
        .with_queue(Arc::new(teardown), handler))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
