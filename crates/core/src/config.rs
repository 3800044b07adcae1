use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job_engine::JobEngineConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub distribution: DistributionConfig,
    pub publisher: PublisherConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub workers: u32,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub default_max_retries: u32,
    pub retry_base_delay_seconds: i64,
    pub retry_backoff_multiplier: u32,
    pub retry_max_delay_seconds: i64,
    pub claim_timeout_seconds: i64,
    pub sync_after_update: bool,
}

#[derive(Clone, Debug)]
pub struct DistributionConfig {
    pub forecast_scale: u32,
    pub utc_offset_minutes: i32,
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub mode: PublisherMode,
    pub endpoint: Option<String>,
    pub auth_token: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherMode {
    Log,
    Webhook,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub scheduler_enabled: Option<bool>,
    pub scheduler_workers: Option<u32>,
    pub publisher_mode: Option<PublisherMode>,
    pub publisher_endpoint: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://demandplan.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            scheduler: SchedulerConfig {
                enabled: true,
                workers: 2,
                poll_interval_ms: 1000,
                batch_size: 10,
                default_max_retries: 3,
                retry_base_delay_seconds: 5,
                retry_backoff_multiplier: 2,
                retry_max_delay_seconds: 3600,
                claim_timeout_seconds: 300,
                sync_after_update: true,
            },
            distribution: DistributionConfig { forecast_scale: 2, utc_offset_minutes: 0 },
            publisher: PublisherConfig {
                mode: PublisherMode::Log,
                endpoint: None,
                auth_token: None,
                timeout_secs: 10,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for PublisherMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "webhook" => Ok(Self::Webhook),
            other => Err(ConfigError::Validation(format!(
                "unsupported publisher mode `{other}` (expected log|webhook)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl SchedulerConfig {
    pub fn engine_config(&self) -> JobEngineConfig {
        JobEngineConfig {
            claim_timeout_seconds: self.claim_timeout_seconds,
            default_max_retries: self.default_max_retries,
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            retry_base_delay_seconds: self.retry_base_delay_seconds,
            retry_max_delay_seconds: self.retry_max_delay_seconds,
        }
    }
}

impl DistributionConfig {
    /// Calendar date used to decide which days are frozen.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
            Some(offset) => now.with_timezone(&offset).date_naive(),
            None => now.date_naive(),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("demandplan.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            let target = &mut self.scheduler;
            if let Some(enabled) = scheduler.enabled {
                target.enabled = enabled;
            }
            if let Some(workers) = scheduler.workers {
                target.workers = workers;
            }
            if let Some(poll_interval_ms) = scheduler.poll_interval_ms {
                target.poll_interval_ms = poll_interval_ms;
            }
            if let Some(batch_size) = scheduler.batch_size {
                target.batch_size = batch_size;
            }
            if let Some(default_max_retries) = scheduler.default_max_retries {
                target.default_max_retries = default_max_retries;
            }
            if let Some(delay) = scheduler.retry_base_delay_seconds {
                target.retry_base_delay_seconds = delay;
            }
            if let Some(multiplier) = scheduler.retry_backoff_multiplier {
                target.retry_backoff_multiplier = multiplier;
            }
            if let Some(delay) = scheduler.retry_max_delay_seconds {
                target.retry_max_delay_seconds = delay;
            }
            if let Some(timeout) = scheduler.claim_timeout_seconds {
                target.claim_timeout_seconds = timeout;
            }
            if let Some(sync_after_update) = scheduler.sync_after_update {
                target.sync_after_update = sync_after_update;
            }
        }

        if let Some(distribution) = patch.distribution {
            if let Some(forecast_scale) = distribution.forecast_scale {
                self.distribution.forecast_scale = forecast_scale;
            }
            if let Some(utc_offset_minutes) = distribution.utc_offset_minutes {
                self.distribution.utc_offset_minutes = utc_offset_minutes;
            }
        }

        if let Some(publisher) = patch.publisher {
            if let Some(mode) = publisher.mode {
                self.publisher.mode = mode.parse()?;
            }
            if let Some(endpoint) = publisher.endpoint {
                self.publisher.endpoint = Some(endpoint);
            }
            if let Some(auth_token_value) = publisher.auth_token {
                self.publisher.auth_token = Some(secret_value(auth_token_value));
            }
            if let Some(timeout_secs) = publisher.timeout_secs {
                self.publisher.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DEMANDPLAN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DEMANDPLAN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DEMANDPLAN_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DEMANDPLAN_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DEMANDPLAN_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DEMANDPLAN_SERVER_PORT") {
            self.server.port = parse_u16("DEMANDPLAN_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("DEMANDPLAN_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_bool("DEMANDPLAN_SCHEDULER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_WORKERS") {
            self.scheduler.workers = parse_u32("DEMANDPLAN_SCHEDULER_WORKERS", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_POLL_INTERVAL_MS") {
            self.scheduler.poll_interval_ms =
                parse_u64("DEMANDPLAN_SCHEDULER_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_BATCH_SIZE") {
            self.scheduler.batch_size = parse_u32("DEMANDPLAN_SCHEDULER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_DEFAULT_MAX_RETRIES") {
            self.scheduler.default_max_retries =
                parse_u32("DEMANDPLAN_SCHEDULER_DEFAULT_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_RETRY_BASE_DELAY_SECONDS") {
            self.scheduler.retry_base_delay_seconds =
                parse_i64("DEMANDPLAN_SCHEDULER_RETRY_BASE_DELAY_SECONDS", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_CLAIM_TIMEOUT_SECONDS") {
            self.scheduler.claim_timeout_seconds =
                parse_i64("DEMANDPLAN_SCHEDULER_CLAIM_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_SCHEDULER_SYNC_AFTER_UPDATE") {
            self.scheduler.sync_after_update =
                parse_bool("DEMANDPLAN_SCHEDULER_SYNC_AFTER_UPDATE", &value)?;
        }

        if let Some(value) = read_env("DEMANDPLAN_DISTRIBUTION_FORECAST_SCALE") {
            self.distribution.forecast_scale =
                parse_u32("DEMANDPLAN_DISTRIBUTION_FORECAST_SCALE", &value)?;
        }
        if let Some(value) = read_env("DEMANDPLAN_DISTRIBUTION_UTC_OFFSET_MINUTES") {
            self.distribution.utc_offset_minutes =
                parse_i32("DEMANDPLAN_DISTRIBUTION_UTC_OFFSET_MINUTES", &value)?;
        }

        if let Some(value) = read_env("DEMANDPLAN_PUBLISHER_MODE") {
            self.publisher.mode = value.parse()?;
        }
        if let Some(value) = read_env("DEMANDPLAN_PUBLISHER_ENDPOINT") {
            self.publisher.endpoint = Some(value);
        }
        if let Some(value) = read_env("DEMANDPLAN_PUBLISHER_AUTH_TOKEN") {
            self.publisher.auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("DEMANDPLAN_PUBLISHER_TIMEOUT_SECS") {
            self.publisher.timeout_secs = parse_u64("DEMANDPLAN_PUBLISHER_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("DEMANDPLAN_LOGGING_LEVEL").or_else(|| read_env("DEMANDPLAN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DEMANDPLAN_LOGGING_FORMAT").or_else(|| read_env("DEMANDPLAN_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = enabled;
        }
        if let Some(workers) = overrides.scheduler_workers {
            self.scheduler.workers = workers;
        }
        if let Some(mode) = overrides.publisher_mode {
            self.publisher.mode = mode;
        }
        if let Some(endpoint) = overrides.publisher_endpoint {
            self.publisher.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_scheduler(&self.scheduler)?;
        validate_distribution(&self.distribution)?;
        validate_publisher(&self.publisher)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("demandplan.toml"), PathBuf::from("config/demandplan.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.workers == 0 || scheduler.workers > 64 {
        return Err(ConfigError::Validation(
            "scheduler.workers must be in range 1..=64".to_string(),
        ));
    }
    if scheduler.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "scheduler.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if scheduler.batch_size == 0 {
        return Err(ConfigError::Validation(
            "scheduler.batch_size must be greater than zero".to_string(),
        ));
    }
    if scheduler.retry_base_delay_seconds < 0 || scheduler.retry_max_delay_seconds < 0 {
        return Err(ConfigError::Validation(
            "scheduler retry delays must not be negative".to_string(),
        ));
    }
    if scheduler.claim_timeout_seconds <= 0 {
        return Err(ConfigError::Validation(
            "scheduler.claim_timeout_seconds must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_distribution(distribution: &DistributionConfig) -> Result<(), ConfigError> {
    if distribution.forecast_scale > 10 {
        return Err(ConfigError::Validation(
            "distribution.forecast_scale must be in range 0..=10".to_string(),
        ));
    }
    if distribution.utc_offset_minutes.abs() > 14 * 60 {
        return Err(ConfigError::Validation(
            "distribution.utc_offset_minutes must be within +/-840".to_string(),
        ));
    }
    Ok(())
}

fn validate_publisher(publisher: &PublisherConfig) -> Result<(), ConfigError> {
    if publisher.timeout_secs == 0 || publisher.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "publisher.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if publisher.mode == PublisherMode::Webhook {
        let endpoint = publisher.endpoint.as_deref().map(str::trim).unwrap_or_default();
        if endpoint.is_empty() {
            return Err(ConfigError::Validation(
                "publisher.endpoint is required when publisher.mode is webhook".to_string(),
            ));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::Validation(
                "publisher.endpoint must start with http:// or https://".to_string(),
            ));
        }
    }

    if let Some(token) = &publisher.auth_token {
        if token.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "publisher.auth_token must not be blank when set".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_env(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_env(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_env(key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.parse::<i32>().map_err(|_| invalid_env(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_env(key, value))
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| invalid_env(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_env(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    scheduler: Option<SchedulerPatch>,
    distribution: Option<DistributionPatch>,
    publisher: Option<PublisherPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    enabled: Option<bool>,
    workers: Option<u32>,
    poll_interval_ms: Option<u64>,
    batch_size: Option<u32>,
    default_max_retries: Option<u32>,
    retry_base_delay_seconds: Option<i64>,
    retry_backoff_multiplier: Option<u32>,
    retry_max_delay_seconds: Option<i64>,
    claim_timeout_seconds: Option<i64>,
    sync_after_update: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct DistributionPatch {
    forecast_scale: Option<u32>,
    utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct PublisherPatch {
    mode: Option<String>,
    endpoint: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use chrono::{NaiveDate, TimeZone, Utc};
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, PublisherMode};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;
        ensure(config.scheduler.workers == 2, "two workers by default")?;
        ensure(config.publisher.mode == PublisherMode::Log, "log publisher by default")?;
        ensure(config.distribution.forecast_scale == 2, "two decimal places by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DEMANDPLAN_WEBHOOK_TOKEN", "token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("demandplan.toml");
            fs::write(
                &path,
                r#"
[publisher]
mode = "webhook"
endpoint = "https://events.example.test/demand"
auth_token = "${TEST_DEMANDPLAN_WEBHOOK_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.publisher.mode == PublisherMode::Webhook, "mode should come from file")?;
            ensure(
                config.publisher.auth_token.as_ref().map(|token| token.expose_secret().to_string())
                    == Some("token-from-env".to_string()),
                "auth token should be loaded from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_DEMANDPLAN_WEBHOOK_TOKEN"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEMANDPLAN_LOG_LEVEL", "warn");
        env::set_var("DEMANDPLAN_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["DEMANDPLAN_LOG_LEVEL", "DEMANDPLAN_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEMANDPLAN_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DEMANDPLAN_SCHEDULER_WORKERS", "6");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("demandplan.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[scheduler]
workers = 4
default_max_retries = 0

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.scheduler.workers == 6, "env worker count should win over file")?;
            ensure(
                config.scheduler.default_max_retries == 0,
                "file value should win over defaults",
            )?;
            ensure(
                config.scheduler.engine_config().default_max_retries == 0,
                "engine config should mirror scheduler settings",
            )?;
            Ok(())
        })();

        clear_vars(&["DEMANDPLAN_DATABASE_URL", "DEMANDPLAN_SCHEDULER_WORKERS"]);
        result
    }

    #[test]
    fn invalid_env_values_are_reported_with_their_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEMANDPLAN_SCHEDULER_WORKERS", "many");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected env override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. } if key == "DEMANDPLAN_SCHEDULER_WORKERS"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["DEMANDPLAN_SCHEDULER_WORKERS"]);
        result
    }

    #[test]
    fn webhook_mode_requires_an_endpoint() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                publisher_mode: Some(PublisherMode::Webhook),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("publisher.endpoint")
        );
        ensure(has_message, "validation failure should mention publisher.endpoint")
    }

    #[test]
    fn missing_required_file_is_reported() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("absent.toml");
        let result = AppConfig::load(LoadOptions {
            config_path: Some(path),
            require_file: true,
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::MissingConfigFile(_))),
            "missing file should be an error when required",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DEMANDPLAN_PUBLISHER_AUTH_TOKEN", "very-secret-token");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("very-secret-token"), "debug output should not contain token")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["DEMANDPLAN_PUBLISHER_AUTH_TOKEN"]);
        result
    }

    #[test]
    fn today_honours_the_configured_offset() -> Result<(), String> {
        let mut config = AppConfig::default();
        let now = Utc.with_ymd_and_hms(2023, 11, 9, 20, 30, 0).single().ok_or("valid instant")?;

        ensure(
            config.distribution.today(now) == NaiveDate::from_ymd_opt(2023, 11, 9).ok_or("date")?,
            "utc date by default",
        )?;

        config.distribution.utc_offset_minutes = 7 * 60;
        ensure(
            config.distribution.today(now) == NaiveDate::from_ymd_opt(2023, 11, 10).ok_or("date")?,
            "positive offset can roll into the next day",
        )
    }
}
