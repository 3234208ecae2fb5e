use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::CatalogConfig;
use crate::job_engine::JobEngineConfig;
use crate::quota::QuotaDefaults;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub dispatch: DispatchConfig,
    pub quota: QuotaConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub invalid_response_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub claim_timeout_secs: u64,
    pub recovery_interval_secs: u64,
    pub idempotency_window_secs: u64,
    pub token_estimate_factor: f64,
}

#[derive(Clone, Debug)]
pub struct QuotaConfig {
    pub default_max_requests: u32,
    pub default_max_tokens: u32,
    pub usage_retention_days: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub maintenance_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Wire dialect of the configured provider. Both speak the
/// OpenAI-compatible chat completions API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub worker_count: Option<usize>,
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
                url: "sqlite://noteflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                requests_per_minute: 60,
            },
            dispatch: DispatchConfig {
                max_retries: 3,
                invalid_response_retries: 1,
                retry_base_delay_ms: 500,
                retry_max_delay_ms: 30_000,
                attempt_timeout_secs: 60,
                worker_count: 4,
                queue_capacity: 256,
                claim_timeout_secs: 900,
                recovery_interval_secs: 30,
                idempotency_window_secs: 3600,
                token_estimate_factor: 1.3,
            },
            quota: QuotaConfig {
                default_max_requests: 100,
                default_max_tokens: 10_000,
                usage_retention_days: 90,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                maintenance_interval_secs: 3600,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            catalog: CatalogConfig::default(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
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

impl LlmConfig {
    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => match self.provider {
                LlmProvider::OpenAi => "https://api.openai.com/v1".to_string(),
                LlmProvider::Ollama => "http://localhost:11434/v1".to_string(),
            },
        }
    }
}

impl DispatchConfig {
    /// Longest one execution unit can run: every attempt hits the attempt
    /// timeout and every retry waits the full backoff cap.
    pub fn worst_case_execution_secs(&self) -> u64 {
        let retries = u64::from(self.max_retries) + u64::from(self.invalid_response_retries);
        let attempts = retries + 1;
        let retry_delay_secs = self.retry_max_delay_ms.div_ceil(1000);
        attempts
            .saturating_mul(self.attempt_timeout_secs)
            .saturating_add(retries.saturating_mul(retry_delay_secs))
    }

    pub fn engine_config(&self) -> JobEngineConfig {
        JobEngineConfig {
            max_retries: self.max_retries,
            invalid_response_retries: self.invalid_response_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            claim_timeout: Duration::from_secs(self.claim_timeout_secs),
        }
    }
}

impl QuotaConfig {
    pub fn defaults(&self) -> QuotaDefaults {
        QuotaDefaults {
            max_requests: self.default_max_requests,
            max_tokens: self.default_max_tokens,
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("noteflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
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

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(requests_per_minute) = llm.requests_per_minute {
                self.llm.requests_per_minute = requests_per_minute;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            let target = &mut self.dispatch;
            if let Some(value) = dispatch.max_retries {
                target.max_retries = value;
            }
            if let Some(value) = dispatch.invalid_response_retries {
                target.invalid_response_retries = value;
            }
            if let Some(value) = dispatch.retry_base_delay_ms {
                target.retry_base_delay_ms = value;
            }
            if let Some(value) = dispatch.retry_max_delay_ms {
                target.retry_max_delay_ms = value;
            }
            if let Some(value) = dispatch.attempt_timeout_secs {
                target.attempt_timeout_secs = value;
            }
            if let Some(value) = dispatch.worker_count {
                target.worker_count = value;
            }
            if let Some(value) = dispatch.queue_capacity {
                target.queue_capacity = value;
            }
            if let Some(value) = dispatch.claim_timeout_secs {
                target.claim_timeout_secs = value;
            }
            if let Some(value) = dispatch.recovery_interval_secs {
                target.recovery_interval_secs = value;
            }
            if let Some(value) = dispatch.idempotency_window_secs {
                target.idempotency_window_secs = value;
            }
            if let Some(value) = dispatch.token_estimate_factor {
                target.token_estimate_factor = value;
            }
        }

        if let Some(quota) = patch.quota {
            if let Some(value) = quota.default_max_requests {
                self.quota.default_max_requests = value;
            }
            if let Some(value) = quota.default_max_tokens {
                self.quota.default_max_tokens = value;
            }
            if let Some(value) = quota.usage_retention_days {
                self.quota.usage_retention_days = value;
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
            if let Some(maintenance_interval_secs) = server.maintenance_interval_secs {
                self.server.maintenance_interval_secs = maintenance_interval_secs;
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

        if let Some(catalog) = patch.catalog {
            self.catalog = catalog;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("NOTEFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("NOTEFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("NOTEFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("NOTEFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("NOTEFLOW_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("NOTEFLOW_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("NOTEFLOW_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("NOTEFLOW_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("NOTEFLOW_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("NOTEFLOW_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_LLM_REQUESTS_PER_MINUTE") {
            self.llm.requests_per_minute = parse_u32("NOTEFLOW_LLM_REQUESTS_PER_MINUTE", &value)?;
        }

        if let Some(value) = read_env("NOTEFLOW_DISPATCH_MAX_RETRIES") {
            self.dispatch.max_retries = parse_u32("NOTEFLOW_DISPATCH_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_DISPATCH_WORKER_COUNT") {
            self.dispatch.worker_count = parse_usize("NOTEFLOW_DISPATCH_WORKER_COUNT", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_DISPATCH_ATTEMPT_TIMEOUT_SECS") {
            self.dispatch.attempt_timeout_secs =
                parse_u64("NOTEFLOW_DISPATCH_ATTEMPT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_DISPATCH_RETRY_BASE_DELAY_MS") {
            self.dispatch.retry_base_delay_ms =
                parse_u64("NOTEFLOW_DISPATCH_RETRY_BASE_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("NOTEFLOW_QUOTA_DEFAULT_MAX_REQUESTS") {
            self.quota.default_max_requests =
                parse_u32("NOTEFLOW_QUOTA_DEFAULT_MAX_REQUESTS", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_QUOTA_DEFAULT_MAX_TOKENS") {
            self.quota.default_max_tokens = parse_u32("NOTEFLOW_QUOTA_DEFAULT_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("NOTEFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("NOTEFLOW_SERVER_PORT") {
            self.server.port = parse_u16("NOTEFLOW_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("NOTEFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("NOTEFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("NOTEFLOW_LOGGING_LEVEL").or_else(|| read_env("NOTEFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("NOTEFLOW_LOGGING_FORMAT").or_else(|| read_env("NOTEFLOW_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(worker_count) = overrides.worker_count {
            self.dispatch.worker_count = worker_count;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_dispatch(&self.dispatch)?;
        validate_quota(&self.quota)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_catalog(self)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("noteflow.toml"), PathBuf::from("config/noteflow.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider. Set NOTEFLOW_LLM_API_KEY \
                     or `api_key = \"${OPENAI_API_KEY}\"` under [llm]"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {}
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if dispatch.max_retries > 10 {
        return Err(ConfigError::Validation(
            "dispatch.max_retries must be in range 0..=10".to_string(),
        ));
    }

    if dispatch.retry_base_delay_ms > dispatch.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "dispatch.retry_base_delay_ms must not exceed dispatch.retry_max_delay_ms".to_string(),
        ));
    }

    if dispatch.attempt_timeout_secs == 0 || dispatch.attempt_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "dispatch.attempt_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if dispatch.worker_count == 0 || dispatch.worker_count > 256 {
        return Err(ConfigError::Validation(
            "dispatch.worker_count must be in range 1..=256".to_string(),
        ));
    }

    if dispatch.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "dispatch.queue_capacity must be greater than zero".to_string(),
        ));
    }

    let worst_case = dispatch.worst_case_execution_secs();
    if dispatch.claim_timeout_secs <= worst_case {
        return Err(ConfigError::Validation(format!(
            "dispatch.claim_timeout_secs must be greater than {worst_case}, the longest a job \
             can run with the configured attempts, attempt timeout and backoff cap"
        )));
    }

    if dispatch.recovery_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "dispatch.recovery_interval_secs must be greater than zero".to_string(),
        ));
    }

    if !dispatch.token_estimate_factor.is_finite() || dispatch.token_estimate_factor <= 0.0 {
        return Err(ConfigError::Validation(
            "dispatch.token_estimate_factor must be a positive number".to_string(),
        ));
    }

    Ok(())
}

fn validate_quota(quota: &QuotaConfig) -> Result<(), ConfigError> {
    if quota.default_max_requests == 0 || quota.default_max_tokens == 0 {
        return Err(ConfigError::Validation(
            "quota.default_max_requests and quota.default_max_tokens must be greater than zero"
                .to_string(),
        ));
    }

    if quota.usage_retention_days == 0 {
        return Err(ConfigError::Validation(
            "quota.usage_retention_days must be greater than zero".to_string(),
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

    if server.maintenance_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "server.maintenance_interval_secs must be greater than zero".to_string(),
        ));
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

fn validate_catalog(config: &AppConfig) -> Result<(), ConfigError> {
    config
        .catalog
        .build_registry(&config.llm)
        .map_err(|error| ConfigError::Validation(format!("catalog: {error}")))?;
    config
        .catalog
        .build_templates()
        .map_err(|error| ConfigError::Validation(format!("catalog: {error}")))?;
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    dispatch: Option<DispatchPatch>,
    quota: Option<QuotaPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    catalog: Option<CatalogConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    requests_per_minute: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    max_retries: Option<u32>,
    invalid_response_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    attempt_timeout_secs: Option<u64>,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    claim_timeout_secs: Option<u64>,
    recovery_interval_secs: Option<u64>,
    idempotency_window_secs: Option<u64>,
    token_estimate_factor: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct QuotaPatch {
    default_max_requests: Option<u32>,
    default_max_tokens: Option<u32>,
    usage_retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
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

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

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
    fn defaults_are_valid_without_a_config_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        ensure(config.dispatch.max_retries == 3, "default max_retries should be 3")?;
        ensure(config.quota.default_max_requests == 100, "free tier allows 100 requests")?;
        ensure(config.quota.default_max_tokens == 10_000, "free tier allows 10000 tokens")?;
        ensure(
            (config.dispatch.token_estimate_factor - 1.3).abs() < f64::EPSILON,
            "estimate factor defaults to 1.3",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_NOTEFLOW_OPENAI_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("noteflow.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_NOTEFLOW_OPENAI_KEY}"
model = "gpt-4o-mini"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("sk-from-env".to_string()),
                "api key should be loaded from environment",
            )?;
            ensure(
                config.llm.resolved_base_url() == "https://api.openai.com/v1",
                "openai base url should be used when none is configured",
            )
        })();

        clear_vars(&["TEST_NOTEFLOW_OPENAI_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NOTEFLOW_LOG_LEVEL", "warn");
        env::set_var("NOTEFLOW_LOG_FORMAT", "pretty");

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

        clear_vars(&["NOTEFLOW_LOG_LEVEL", "NOTEFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NOTEFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("NOTEFLOW_DISPATCH_MAX_RETRIES", "5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("noteflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[dispatch]
max_retries = 1
worker_count = 2

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
            ensure(config.dispatch.max_retries == 5, "env max_retries should win over file")?;
            ensure(config.dispatch.worker_count == 2, "file worker_count should win over default")?;
            Ok(())
        })();

        clear_vars(&["NOTEFLOW_DATABASE_URL", "NOTEFLOW_DISPATCH_MAX_RETRIES"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NOTEFLOW_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["NOTEFLOW_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_catalog_is_rejected_at_load() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("noteflow.toml");
        fs::write(
            &path,
            r#"
[[catalog.templates]]
name = "too_hot"
operation = "summarize"
prompt_template = "{content}"
temperature = 1.7
"#,
        )
        .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected catalog validation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::Validation(ref message) if message.contains("too_hot")),
            "validation failure should name the template",
        )
    }

    #[test]
    fn claim_timeout_must_outlast_a_full_retry_cycle() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let defaults = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        ensure(
            defaults.dispatch.worst_case_execution_secs() == 5 * 60 + 4 * 30,
            "five attempts of 60s plus four 30s backoffs",
        )?;
        ensure(
            defaults.dispatch.claim_timeout_secs > defaults.dispatch.worst_case_execution_secs(),
            "default claim timeout should outlast one execution",
        )?;

        env::set_var("NOTEFLOW_DISPATCH_MAX_RETRIES", "10");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected claim timeout to be rejected".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::Validation(ref message)
                        if message.contains("dispatch.claim_timeout_secs") && message.contains("1050")
                ),
                "validation failure should name the claim timeout and the bound",
            )
        })();

        clear_vars(&["NOTEFLOW_DISPATCH_MAX_RETRIES"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("NOTEFLOW_LLM_PROVIDER", "openai");
        env::set_var("NOTEFLOW_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["NOTEFLOW_LLM_PROVIDER", "NOTEFLOW_LLM_API_KEY"]);
        result
    }
}
