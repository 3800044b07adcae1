use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use demandplan_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str| {
        let env_key = format!("DEMANDPLAN_{}", key_path.replace('.', "_").to_ascii_uppercase());
        field_source(key_path, &env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let publisher_endpoint = config.publisher.endpoint.as_deref().unwrap_or("<unset>");
    let publisher_token = config
        .publisher
        .auth_token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let fields: Vec<(&str, String)> = vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("scheduler.enabled", config.scheduler.enabled.to_string()),
        ("scheduler.workers", config.scheduler.workers.to_string()),
        ("scheduler.poll_interval_ms", config.scheduler.poll_interval_ms.to_string()),
        ("scheduler.batch_size", config.scheduler.batch_size.to_string()),
        ("scheduler.default_max_retries", config.scheduler.default_max_retries.to_string()),
        (
            "scheduler.retry_base_delay_seconds",
            config.scheduler.retry_base_delay_seconds.to_string(),
        ),
        ("scheduler.claim_timeout_seconds", config.scheduler.claim_timeout_seconds.to_string()),
        ("scheduler.sync_after_update", config.scheduler.sync_after_update.to_string()),
        ("distribution.forecast_scale", config.distribution.forecast_scale.to_string()),
        ("distribution.utc_offset_minutes", config.distribution.utc_offset_minutes.to_string()),
        ("publisher.mode", format!("{:?}", config.publisher.mode)),
        ("publisher.endpoint", publisher_endpoint.to_string()),
        ("publisher.auth_token", publisher_token),
        ("publisher.timeout_secs", config.publisher.timeout_secs.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.into_iter().map(|(key, value)| render_line(key, &value, source(key))));
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("demandplan.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/demandplan.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    let visible: String = trimmed.chars().take(4).collect();
    if trimmed.chars().count() > 8 {
        return format!("{visible}***");
    }

    "<redacted>".to_string()
}
