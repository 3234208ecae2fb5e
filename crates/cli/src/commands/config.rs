use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use noteflow_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    env_key: Option<&'static str>,
    value: String,
}

fn field(key: &'static str, env_key: Option<&'static str>, value: impl ToString) -> Field {
    Field { key, env_key, value: value.to_string() }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    let fields = [
        field("database.url", Some("NOTEFLOW_DATABASE_URL"), &config.database.url),
        field(
            "database.max_connections",
            Some("NOTEFLOW_DATABASE_MAX_CONNECTIONS"),
            config.database.max_connections,
        ),
        field("llm.provider", Some("NOTEFLOW_LLM_PROVIDER"), config.llm.provider.as_str()),
        field("llm.model", Some("NOTEFLOW_LLM_MODEL"), &config.llm.model),
        field("llm.base_url", Some("NOTEFLOW_LLM_BASE_URL"), config.llm.resolved_base_url()),
        field("llm.api_key", Some("NOTEFLOW_LLM_API_KEY"), api_key),
        field("llm.timeout_secs", Some("NOTEFLOW_LLM_TIMEOUT_SECS"), config.llm.timeout_secs),
        field(
            "dispatch.max_retries",
            Some("NOTEFLOW_DISPATCH_MAX_RETRIES"),
            config.dispatch.max_retries,
        ),
        field(
            "dispatch.retry_base_delay_ms",
            Some("NOTEFLOW_DISPATCH_RETRY_BASE_DELAY_MS"),
            config.dispatch.retry_base_delay_ms,
        ),
        field(
            "dispatch.attempt_timeout_secs",
            Some("NOTEFLOW_DISPATCH_ATTEMPT_TIMEOUT_SECS"),
            config.dispatch.attempt_timeout_secs,
        ),
        field(
            "dispatch.worker_count",
            Some("NOTEFLOW_DISPATCH_WORKER_COUNT"),
            config.dispatch.worker_count,
        ),
        field("dispatch.queue_capacity", None, config.dispatch.queue_capacity),
        field("dispatch.idempotency_window_secs", None, config.dispatch.idempotency_window_secs),
        field(
            "quota.default_max_requests",
            Some("NOTEFLOW_QUOTA_DEFAULT_MAX_REQUESTS"),
            config.quota.default_max_requests,
        ),
        field(
            "quota.default_max_tokens",
            Some("NOTEFLOW_QUOTA_DEFAULT_MAX_TOKENS"),
            config.quota.default_max_tokens,
        ),
        field("quota.usage_retention_days", None, config.quota.usage_retention_days),
        field("server.bind_address", Some("NOTEFLOW_SERVER_BIND_ADDRESS"), &config.server.bind_address),
        field("server.port", Some("NOTEFLOW_SERVER_PORT"), config.server.port),
        field("logging.level", Some("NOTEFLOW_LOGGING_LEVEL"), &config.logging.level),
        field(
            "logging.format",
            Some("NOTEFLOW_LOGGING_FORMAT"),
            format!("{:?}", config.logging.format).to_lowercase(),
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in &fields {
        let source =
            field_source(field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }
    lines.push(format!(
        "- catalog = {} provider(s), {} model(s), {} template override(s)",
        config.catalog.providers.len(),
        config.catalog.models.len(),
        config.catalog.templates.len(),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["noteflow.toml", "config/noteflow.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    field: &Field,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = field.env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
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
