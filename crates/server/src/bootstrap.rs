use std::sync::Arc;
use std::time::Duration;

use demandplan_core::config::{AppConfig, ConfigError};
use demandplan_core::errors::DemandError;
use demandplan_core::job_engine::JobStateMachine;
use demandplan_db::repositories::{SqlClassificationIndex, SqlDemandStore, SqlScheduleJobRepository};
use demandplan_db::{connect_with_config, migrations, DbPool};
use demandplan_scheduler::{build_publisher, DemandPlanningService, JobHandler, JobWorker, WorkerPool};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: Arc<DemandPlanningService>,
    pub workers: WorkerPool,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("event publisher setup failed: {0}")]
    Publisher(#[source] DemandError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let publisher = build_publisher(&config.publisher).map_err(BootstrapError::Publisher)?;
    let store = Arc::new(SqlDemandStore::new(db_pool.clone()));
    let jobs = Arc::new(SqlScheduleJobRepository::new(db_pool.clone()));
    let classification = Arc::new(SqlClassificationIndex::new(db_pool.clone()));
    let state_machine = JobStateMachine::with_config(config.scheduler.engine_config());
    let scale = config.distribution.forecast_scale;

    let service = Arc::new(
        DemandPlanningService::new(store.clone(), jobs.clone(), classification.clone())
            .with_state_machine(state_machine.clone())
            .with_scale(scale),
    );

    let handler = Arc::new(
        JobHandler::new(store, classification, publisher)
            .with_state_machine(state_machine.clone())
            .with_scale(scale)
            .with_sync_after_update(config.scheduler.sync_after_update),
    );
    let worker_count = if config.scheduler.enabled { config.scheduler.workers } else { 0 };
    let workers = (1..=worker_count)
        .map(|index| {
            JobWorker::new(
                format!("worker-{index}"),
                jobs.clone(),
                handler.clone(),
                state_machine.clone(),
                config.distribution.clone(),
            )
            .with_batch_size(config.scheduler.batch_size)
        })
        .collect();
    let workers =
        WorkerPool::new(workers, Duration::from_millis(config.scheduler.poll_interval_ms.max(1)));

    info!(
        event_name = "system.bootstrap.scheduler_ready",
        correlation_id = "bootstrap",
        workers = workers.len(),
        publisher_mode = ?config.publisher.mode,
        "job scheduler assembled"
    );

    Ok(Application { config, db_pool, service, workers })
}
