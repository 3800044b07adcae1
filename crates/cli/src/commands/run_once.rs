use std::sync::Arc;

use chrono::Utc;
use demandplan_core::{DemandError, JobStateMachine};
use demandplan_scheduler::{build_publisher, JobHandler, JobWorker};

use crate::commands::{exit, load_config, runtime, CommandResult, Stores};

/// Drains one batch of due jobs in the foreground, then exits.
pub fn run(batch_size: Option<u32>) -> CommandResult {
    let config = match load_config("run-once") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("run-once") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let publisher = build_publisher(&config.publisher)
            .map_err(|error| ("publisher_setup", error.to_string(), exit::CONFIG))?;
        let stores = Stores::open(&config).await?;
        let state_machine = JobStateMachine::with_config(config.scheduler.engine_config());

        let handler = JobHandler::new(stores.store, stores.classification, publisher)
            .with_state_machine(state_machine.clone())
            .with_scale(config.distribution.forecast_scale)
            .with_sync_after_update(config.scheduler.sync_after_update);
        let worker = JobWorker::new(
            "cli-run-once",
            stores.jobs,
            Arc::new(handler),
            state_machine,
            config.distribution.clone(),
        )
        .with_batch_size(batch_size.unwrap_or(config.scheduler.batch_size));

        let now = Utc::now();
        let outcome = async {
            let released = worker.recover_stale(now).await?;
            let report = worker.run_once(now).await?;
            Ok::<_, DemandError>((released, report))
        }
        .await
        .map_err(|error| ("job_execution", error.to_string(), exit::JOB));
        stores.pool.close().await;
        outcome
    });

    match result {
        Ok((released, report)) => CommandResult::success(
            "run-once",
            format!(
                "claimed {} job(s): {} processed, {} retry scheduled, {} failed, {} conflicts; {} stale claim(s) released",
                report.claimed,
                report.processed,
                report.retried,
                report.failed,
                report.conflicts,
                released
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("run-once", error_class, message, exit_code)
        }
    }
}
