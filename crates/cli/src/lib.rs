pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::commands::enqueue::PayloadSource;

#[derive(Debug, Parser)]
#[command(
    name = "demandplan",
    about = "Demandplan operator CLI",
    long_about = "Operate the demand rollup engine: migrations, readiness checks, config inspection, job submission and queue maintenance.",
    after_help = "Examples:\n  demandplan doctor --json\n  demandplan enqueue --file job.json\n  demandplan run-once\n  demandplan refresh-latest-groups --seller-id 7 --month 2025-03 --group-by category"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Validate config, publisher readiness, DB connectivity and schema version")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate a job payload and add it to the queue as unprocessed")]
    Enqueue {
        #[arg(long, conflicts_with = "file", help = "Inline JSON job payload")]
        payload: Option<String>,
        #[arg(long, help = "Path to a file holding the JSON job payload")]
        file: Option<PathBuf>,
        #[arg(long, help = "Override the configured retry budget for this job")]
        max_retries: Option<u32>,
        #[arg(long, help = "Correlation id to carry through logs and follow-up jobs")]
        correlation_id: Option<String>,
    },
    #[command(about = "Claim and execute one batch of due jobs, then exit")]
    RunOnce {
        #[arg(long, help = "Maximum number of jobs to claim")]
        batch_size: Option<u32>,
    },
    #[command(about = "Recompute latest-group flags from the month's classification paths")]
    RefreshLatestGroups {
        #[arg(long)]
        seller_id: i64,
        #[arg(long, help = "Month as YYYY-MM")]
        month: String,
        #[arg(long, help = "category or segment")]
        group_by: String,
        #[arg(long, default_value = "cli")]
        updated_by: String,
    },
    #[command(about = "Return jobs with expired claims to the queue")]
    RecoverStale {
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Enqueue { payload, file, max_retries, correlation_id } => {
            let source = match (payload.as_deref(), file.as_deref()) {
                (Some(json), _) => Some(PayloadSource::Inline(json)),
                (None, Some(path)) => Some(PayloadSource::File(path)),
                (None, None) => None,
            };
            match source {
                Some(source) => {
                    commands::enqueue::run(source, max_retries, correlation_id.as_deref())
                }
                None => commands::CommandResult::failure(
                    "enqueue",
                    "invalid_argument",
                    "either --payload or --file is required",
                    commands::exit::INPUT,
                ),
            }
        }
        Command::RunOnce { batch_size } => commands::run_once::run(batch_size),
        Command::RefreshLatestGroups { seller_id, month, group_by, updated_by } => {
            commands::maintenance::refresh_latest_groups(seller_id, &month, &group_by, &updated_by)
        }
        Command::RecoverStale { limit } => commands::maintenance::recover_stale(limit),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
