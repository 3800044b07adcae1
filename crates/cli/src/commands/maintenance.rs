use chrono::Utc;
use demandplan_core::{DemandScope, GroupBy, JobStateMachine, MonthOfYear};
use demandplan_scheduler::DemandPlanningService;

use crate::commands::{exit, load_config, runtime, CommandResult, Stores};

/// Recomputes `is_latest_group` for one seller, month and hierarchy.
pub fn refresh_latest_groups(
    seller_id: i64,
    month: &str,
    group_by: &str,
    updated_by: &str,
) -> CommandResult {
    const COMMAND: &str = "refresh-latest-groups";

    let month = match MonthOfYear::parse(month) {
        Ok(month) => month,
        Err(error) => {
            return CommandResult::failure(COMMAND, "invalid_argument", error.to_string(), exit::INPUT);
        }
    };
    let Some(group_by) = GroupBy::parse(group_by) else {
        return CommandResult::failure(
            COMMAND,
            "invalid_argument",
            format!("unknown group_by `{group_by}` (expected category|segment)"),
            exit::INPUT,
        );
    };

    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let scope = DemandScope { seller_id, month };
    let result = runtime.block_on(async {
        let stores = Stores::open(&config).await?;
        let service =
            DemandPlanningService::new(stores.store, stores.jobs, stores.classification);
        let flipped = service
            .refresh_latest_groups(scope, group_by, updated_by)
            .await
            .map_err(|error| ("refresh_failed", error.to_string(), exit::JOB));
        stores.pool.close().await;
        flipped
    });

    match result {
        Ok(flipped) => CommandResult::success(
            COMMAND,
            format!("{flipped} {group_by} group row(s) changed latest flag for {scope}"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}

/// Returns jobs whose claim outlived the claim timeout to the queue.
pub fn recover_stale(limit: u32) -> CommandResult {
    const COMMAND: &str = "recover-stale";

    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let stores = Stores::open(&config).await?;
        let service =
            DemandPlanningService::new(stores.store, stores.jobs, stores.classification)
                .with_state_machine(JobStateMachine::with_config(
                    config.scheduler.engine_config(),
                ));
        let released = service
            .recover_stale(Utc::now(), limit)
            .await
            .map_err(|error| ("recovery_failed", error.to_string(), exit::JOB));
        stores.pool.close().await;
        released
    });

    match result {
        Ok(released) => {
            CommandResult::success(COMMAND, format!("released {released} stale claim(s)"))
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}
