use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use demandplan_cli::commands::enqueue::PayloadSource;
use demandplan_cli::commands::{config, doctor, enqueue, maintenance, migrate, run_once};
use serde_json::Value;

const SKU_JOB: &str = r#"{
    "type": "update-sku-demand",
    "payload": {
        "seller_id": 7,
        "sku": "sku-1",
        "site_id": 1,
        "month_of_year": "2099-01",
        "metrics": { "forecast": "100" }
    }
}"#;

#[test]
fn migrate_returns_success_with_valid_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("DEMANDPLAN_DATABASE_URL", &database_url(dir.path()))], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_bad_override() {
    with_env(&[("DEMANDPLAN_SCHEDULER_WORKERS", "many")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn doctor_reports_pending_schema_until_migrated() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("DEMANDPLAN_DATABASE_URL", &database_url(dir.path()))], || {
        let before = parse_payload(&doctor::run(true));
        assert_eq!(before["overall_status"], "fail");
        assert_eq!(check_status(&before, "database_connectivity"), "pass");
        assert_eq!(check_status(&before, "schema_version"), "fail");

        assert_eq!(migrate::run().exit_code, 0);

        let after = parse_payload(&doctor::run(true));
        assert_eq!(after["overall_status"], "pass");
        assert_eq!(check_status(&after, "publisher_readiness"), "pass");
        assert_eq!(check_status(&after, "schema_version"), "pass");
    });
}

#[test]
fn doctor_flags_webhook_without_endpoint() {
    with_env(&[("DEMANDPLAN_PUBLISHER_MODE", "webhook")], || {
        let report = parse_payload(&doctor::run(true));
        assert_eq!(report["overall_status"], "fail");
    });
}

#[test]
fn config_attributes_env_sources() {
    with_env(&[("DEMANDPLAN_SERVER_PORT", "9100")], || {
        let output = config::run();
        assert!(output.contains("- server.port = 9100 (source: env (DEMANDPLAN_SERVER_PORT))"));
        assert!(output.contains("- logging.level = info (source: default)"));
        assert!(output.contains("- publisher.auth_token = <unset> (source: default)"));
    });
}

#[test]
fn enqueue_rejects_malformed_payload_before_touching_database() {
    with_env(&[], || {
        let result = enqueue::run(PayloadSource::Inline("{\"type\": \"unknown\"}"), None, None);
        assert_eq!(result.exit_code, 6);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "enqueue");
        assert_eq!(payload["error_class"], "invalid_payload");
    });
}

#[test]
fn enqueue_reads_payload_file_and_run_once_schedules_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job_file = dir.path().join("job.json");
    std::fs::write(&job_file, SKU_JOB).expect("write job file");

    with_env(&[("DEMANDPLAN_DATABASE_URL", &database_url(dir.path()))], || {
        assert_eq!(migrate::run().exit_code, 0);

        let enqueued = enqueue::run(PayloadSource::File(&job_file), Some(3), Some("cid-cli"));
        assert_eq!(enqueued.exit_code, 0, "unexpected output: {}", enqueued.output);
        let payload = parse_payload(&enqueued.output);
        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.starts_with("enqueued update-sku-demand job"));
        assert!(message.contains("correlation cid-cli"));

        // No classification exists for sku-1, so the first attempt is retried.
        let tick = run_once::run(None);
        assert_eq!(tick.exit_code, 0, "unexpected output: {}", tick.output);
        let message = parse_payload(&tick.output)["message"].as_str().unwrap_or_default().to_string();
        assert!(message.starts_with("claimed 1 job(s): 0 processed, 1 retry scheduled"));
    });
}

#[test]
fn refresh_latest_groups_validates_arguments_and_classification() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("DEMANDPLAN_DATABASE_URL", &database_url(dir.path()))], || {
        let bad_month = maintenance::refresh_latest_groups(7, "2099-13", "category", "cli");
        assert_eq!(bad_month.exit_code, 6);

        let bad_hierarchy = maintenance::refresh_latest_groups(7, "2099-01", "brand", "cli");
        assert_eq!(bad_hierarchy.exit_code, 6);

        assert_eq!(migrate::run().exit_code, 0);
        let missing = maintenance::refresh_latest_groups(7, "2099-01", "category", "cli");
        assert_eq!(missing.exit_code, 7);
        assert_eq!(parse_payload(&missing.output)["error_class"], "refresh_failed");
    });
}

#[test]
fn recover_stale_on_empty_queue_releases_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("DEMANDPLAN_DATABASE_URL", &database_url(dir.path()))], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = maintenance::recover_stale(50);
        assert_eq!(result.exit_code, 0);
        assert_eq!(parse_payload(&result.output)["message"], "released 0 stale claim(s)");
    });
}

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("cli.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn check_status(report: &Value, name: &str) -> String {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .and_then(|check| check["status"].as_str())
        .unwrap_or("missing")
        .to_string()
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let keys = [
        "DEMANDPLAN_DATABASE_URL",
        "DEMANDPLAN_DATABASE_MAX_CONNECTIONS",
        "DEMANDPLAN_DATABASE_TIMEOUT_SECS",
        "DEMANDPLAN_SERVER_BIND_ADDRESS",
        "DEMANDPLAN_SERVER_PORT",
        "DEMANDPLAN_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "DEMANDPLAN_SCHEDULER_ENABLED",
        "DEMANDPLAN_SCHEDULER_WORKERS",
        "DEMANDPLAN_SCHEDULER_POLL_INTERVAL_MS",
        "DEMANDPLAN_SCHEDULER_BATCH_SIZE",
        "DEMANDPLAN_SCHEDULER_DEFAULT_MAX_RETRIES",
        "DEMANDPLAN_SCHEDULER_RETRY_BASE_DELAY_SECONDS",
        "DEMANDPLAN_SCHEDULER_CLAIM_TIMEOUT_SECONDS",
        "DEMANDPLAN_SCHEDULER_SYNC_AFTER_UPDATE",
        "DEMANDPLAN_DISTRIBUTION_FORECAST_SCALE",
        "DEMANDPLAN_DISTRIBUTION_UTC_OFFSET_MINUTES",
        "DEMANDPLAN_PUBLISHER_MODE",
        "DEMANDPLAN_PUBLISHER_ENDPOINT",
        "DEMANDPLAN_PUBLISHER_AUTH_TOKEN",
        "DEMANDPLAN_PUBLISHER_TIMEOUT_SECS",
        "DEMANDPLAN_LOGGING_LEVEL",
        "DEMANDPLAN_LOGGING_FORMAT",
        "DEMANDPLAN_LOG_LEVEL",
        "DEMANDPLAN_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
