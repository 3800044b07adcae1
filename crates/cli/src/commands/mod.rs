pub mod config;
pub mod doctor;
pub mod enqueue;
pub mod maintenance;
pub mod migrate;
pub mod run_once;

use std::sync::Arc;

use demandplan_core::config::{AppConfig, LoadOptions};
use demandplan_db::repositories::{SqlClassificationIndex, SqlDemandStore, SqlScheduleJobRepository};
use demandplan_db::{connect_with_config, DbPool};
use serde::Serialize;
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Exit codes shared by every command.
pub(crate) mod exit {
    pub const CONFIG: u8 = 2;
    pub const RUNTIME: u8 = 3;
    pub const DATABASE: u8 = 4;
    pub const MIGRATION: u8 = 5;
    pub const INPUT: u8 = 6;
    pub const JOB: u8 = 7;
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            exit::CONFIG,
        )
    })
}

pub(crate) fn runtime(command: &str) -> Result<Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            exit::RUNTIME,
        )
    })
}

/// Sql-backed collaborators over one pool, for commands that touch demand data.
pub(crate) struct Stores {
    pub pool: DbPool,
    pub store: Arc<SqlDemandStore>,
    pub jobs: Arc<SqlScheduleJobRepository>,
    pub classification: Arc<SqlClassificationIndex>,
}

impl Stores {
    pub async fn open(config: &AppConfig) -> Result<Self, (&'static str, String, u8)> {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), exit::DATABASE))?;
        Ok(Self {
            store: Arc::new(SqlDemandStore::new(pool.clone())),
            jobs: Arc::new(SqlScheduleJobRepository::new(pool.clone())),
            classification: Arc::new(SqlClassificationIndex::new(pool.clone())),
            pool,
        })
    }
}
