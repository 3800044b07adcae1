use std::fs;
use std::path::Path;

use demandplan_core::JobPayload;
use demandplan_scheduler::DemandPlanningService;

use crate::commands::{exit, load_config, runtime, CommandResult, Stores};

/// Where the job payload comes from: inline JSON or a file holding it.
#[derive(Debug, Clone)]
pub enum PayloadSource<'a> {
    Inline(&'a str),
    File(&'a Path),
}

/// Parses `{"type": "...", "payload": {...}}` and enqueues it as `unprocessed`.
pub fn run(
    source: PayloadSource<'_>,
    max_retries: Option<u32>,
    correlation_id: Option<&str>,
) -> CommandResult {
    let raw = match source {
        PayloadSource::Inline(json) => json.to_string(),
        PayloadSource::File(path) => match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) => {
                return CommandResult::failure(
                    "enqueue",
                    "payload_read",
                    format!("failed to read `{}`: {error}", path.display()),
                    exit::INPUT,
                );
            }
        },
    };

    let payload: JobPayload = match serde_json::from_str(&raw) {
        Ok(payload) => payload,
        Err(error) => {
            return CommandResult::failure(
                "enqueue",
                "invalid_payload",
                format!("job payload is not valid: {error}"),
                exit::INPUT,
            );
        }
    };

    let config = match load_config("enqueue") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("enqueue") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let correlation_id = correlation_id
        .map(str::to_string)
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
    let max_retries = max_retries.or(Some(config.scheduler.default_max_retries));

    let result = runtime.block_on(async {
        let stores = Stores::open(&config).await?;
        let service =
            DemandPlanningService::new(stores.store, stores.jobs, stores.classification)
                .with_scale(config.distribution.forecast_scale);
        let job = service
            .submit_job(payload, max_retries, &correlation_id)
            .await
            .map_err(|error| ("job_rejected", error.to_string(), exit::JOB));
        stores.pool.close().await;
        job
    });

    match result {
        Ok(job) => CommandResult::success(
            "enqueue",
            format!(
                "enqueued {} job {} (seller {}, correlation {})",
                job.job_type, job.id, job.seller_id, job.correlation_id
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("enqueue", error_class, message, exit_code)
        }
    }
}
