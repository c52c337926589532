use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialogue::DialogueConfig;
use crate::health::HealthConfig;
use crate::memory::MemoryConfig;
use crate::safety::SafetyConfig;

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub dialogue: DialogueSettings,
    pub safety: SafetySettings,
    pub memory: MemorySettings,
    pub health: HealthSettings,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DialogueSettings {
    pub max_turns: u32,
    pub max_tokens: u64,
    pub max_duration_secs: u64,
    pub checksum_interval_secs: u64,
    pub token_divisor: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SafetySettings {
    pub cost_threshold: f64,
    pub cost_window_secs: u64,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub token_rate_threshold: f64,
    pub check_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemorySettings {
    pub integrity_interval_secs: u64,
    pub embedding_dimensions: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthSettings {
    pub heartbeat_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub metrics_retention_secs: u64,
    pub significant_delta: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    pub lock_path: PathBuf,
    pub incident_log_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
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
    pub lock_path: Option<PathBuf>,
    pub incident_log_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub max_turns: Option<u32>,
    pub max_tokens: Option<u64>,
    pub health_check_port: Option<u16>,
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
            dialogue: DialogueSettings {
                max_turns: 100,
                max_tokens: 100_000,
                max_duration_secs: 3_600,
                checksum_interval_secs: 60,
                token_divisor: 4,
            },
            safety: SafetySettings {
                cost_threshold: 10.0,
                cost_window_secs: 3_600,
                cpu_threshold: 80.0,
                memory_threshold: 80.0,
                token_rate_threshold: 10_000.0,
                check_interval_secs: 5,
            },
            memory: MemorySettings { integrity_interval_secs: 300, embedding_dimensions: 384 },
            health: HealthSettings {
                heartbeat_interval_secs: 30,
                health_check_interval_secs: 10,
                metrics_retention_secs: 3_600,
                significant_delta: 20.0,
            },
            storage: StorageConfig {
                database_url: "sqlite://concord.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
                lock_path: PathBuf::from("data/act_mode.lock"),
                incident_log_path: PathBuf::from("data/incidents.log"),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
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

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concord.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn dialogue_config(&self) -> DialogueConfig {
        DialogueConfig {
            max_turns: self.dialogue.max_turns,
            max_tokens: self.dialogue.max_tokens,
            max_duration: Duration::from_secs(self.dialogue.max_duration_secs),
            checksum_interval: Duration::from_secs(self.dialogue.checksum_interval_secs),
            token_divisor: usize::try_from(self.dialogue.token_divisor).unwrap_or(usize::MAX),
        }
    }

    pub fn safety_config(&self) -> SafetyConfig {
        SafetyConfig {
            cost_threshold: self.safety.cost_threshold,
            cost_window: Duration::from_secs(self.safety.cost_window_secs),
            cpu_threshold: self.safety.cpu_threshold,
            memory_threshold: self.safety.memory_threshold,
            token_rate_threshold: self.safety.token_rate_threshold,
            check_interval: Duration::from_secs(self.safety.check_interval_secs),
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            integrity_interval: Duration::from_secs(self.memory.integrity_interval_secs),
            embedding_dimensions: self.memory.embedding_dimensions,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            heartbeat_interval: Duration::from_secs(self.health.heartbeat_interval_secs),
            health_check_interval: Duration::from_secs(self.health.health_check_interval_secs),
            metrics_retention: Duration::from_secs(self.health.metrics_retention_secs),
            significant_delta: self.health.significant_delta,
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(dialogue) = patch.dialogue {
            if let Some(max_turns) = dialogue.max_turns {
                self.dialogue.max_turns = max_turns;
            }
            if let Some(max_tokens) = dialogue.max_tokens {
                self.dialogue.max_tokens = max_tokens;
            }
            if let Some(max_duration_secs) = dialogue.max_duration_secs {
                self.dialogue.max_duration_secs = max_duration_secs;
            }
            if let Some(checksum_interval_secs) = dialogue.checksum_interval_secs {
                self.dialogue.checksum_interval_secs = checksum_interval_secs;
            }
            if let Some(token_divisor) = dialogue.token_divisor {
                self.dialogue.token_divisor = token_divisor;
            }
        }

        if let Some(safety) = patch.safety {
            if let Some(cost_threshold) = safety.cost_threshold {
                self.safety.cost_threshold = cost_threshold;
            }
            if let Some(cost_window_secs) = safety.cost_window_secs {
                self.safety.cost_window_secs = cost_window_secs;
            }
            if let Some(cpu_threshold) = safety.cpu_threshold {
                self.safety.cpu_threshold = cpu_threshold;
            }
            if let Some(memory_threshold) = safety.memory_threshold {
                self.safety.memory_threshold = memory_threshold;
            }
            if let Some(token_rate_threshold) = safety.token_rate_threshold {
                self.safety.token_rate_threshold = token_rate_threshold;
            }
            if let Some(check_interval_secs) = safety.check_interval_secs {
                self.safety.check_interval_secs = check_interval_secs;
            }
        }

        if let Some(memory) = patch.memory {
            if let Some(integrity_interval_secs) = memory.integrity_interval_secs {
                self.memory.integrity_interval_secs = integrity_interval_secs;
            }
            if let Some(embedding_dimensions) = memory.embedding_dimensions {
                self.memory.embedding_dimensions = embedding_dimensions;
            }
        }

        if let Some(health) = patch.health {
            if let Some(heartbeat_interval_secs) = health.heartbeat_interval_secs {
                self.health.heartbeat_interval_secs = heartbeat_interval_secs;
            }
            if let Some(health_check_interval_secs) = health.health_check_interval_secs {
                self.health.health_check_interval_secs = health_check_interval_secs;
            }
            if let Some(metrics_retention_secs) = health.metrics_retention_secs {
                self.health.metrics_retention_secs = metrics_retention_secs;
            }
            if let Some(significant_delta) = health.significant_delta {
                self.health.significant_delta = significant_delta;
            }
        }

        if let Some(storage) = patch.storage {
            if let Some(database_url) = storage.database_url {
                self.storage.database_url = database_url;
            }
            if let Some(max_connections) = storage.max_connections {
                self.storage.max_connections = max_connections;
            }
            if let Some(timeout_secs) = storage.timeout_secs {
                self.storage.timeout_secs = timeout_secs;
            }
            if let Some(lock_path) = storage.lock_path {
                self.storage.lock_path = lock_path;
            }
            if let Some(incident_log_path) = storage.incident_log_path {
                self.storage.incident_log_path = incident_log_path;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
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
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCORD_DIALOGUE_MAX_TURNS") {
            self.dialogue.max_turns = parse_u32("CONCORD_DIALOGUE_MAX_TURNS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_DIALOGUE_MAX_TOKENS") {
            self.dialogue.max_tokens = parse_u64("CONCORD_DIALOGUE_MAX_TOKENS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_DIALOGUE_MAX_DURATION_SECS") {
            self.dialogue.max_duration_secs =
                parse_u64("CONCORD_DIALOGUE_MAX_DURATION_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_DIALOGUE_CHECKSUM_INTERVAL_SECS") {
            self.dialogue.checksum_interval_secs =
                parse_u64("CONCORD_DIALOGUE_CHECKSUM_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_DIALOGUE_TOKEN_DIVISOR") {
            self.dialogue.token_divisor = parse_u32("CONCORD_DIALOGUE_TOKEN_DIVISOR", &value)?;
        }

        if let Some(value) = read_env("CONCORD_SAFETY_COST_THRESHOLD") {
            self.safety.cost_threshold = parse_f64("CONCORD_SAFETY_COST_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCORD_SAFETY_COST_WINDOW_SECS") {
            self.safety.cost_window_secs = parse_u64("CONCORD_SAFETY_COST_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_SAFETY_CPU_THRESHOLD") {
            self.safety.cpu_threshold = parse_f64("CONCORD_SAFETY_CPU_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCORD_SAFETY_MEMORY_THRESHOLD") {
            self.safety.memory_threshold = parse_f64("CONCORD_SAFETY_MEMORY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCORD_SAFETY_TOKEN_RATE_THRESHOLD") {
            self.safety.token_rate_threshold =
                parse_f64("CONCORD_SAFETY_TOKEN_RATE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCORD_SAFETY_CHECK_INTERVAL_SECS") {
            self.safety.check_interval_secs =
                parse_u64("CONCORD_SAFETY_CHECK_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCORD_MEMORY_INTEGRITY_INTERVAL_SECS") {
            self.memory.integrity_interval_secs =
                parse_u64("CONCORD_MEMORY_INTEGRITY_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_MEMORY_EMBEDDING_DIMENSIONS") {
            self.memory.embedding_dimensions =
                parse_usize("CONCORD_MEMORY_EMBEDDING_DIMENSIONS", &value)?;
        }

        if let Some(value) = read_env("CONCORD_HEALTH_HEARTBEAT_INTERVAL_SECS") {
            self.health.heartbeat_interval_secs =
                parse_u64("CONCORD_HEALTH_HEARTBEAT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_HEALTH_CHECK_INTERVAL_SECS") {
            self.health.health_check_interval_secs =
                parse_u64("CONCORD_HEALTH_CHECK_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_HEALTH_METRICS_RETENTION_SECS") {
            self.health.metrics_retention_secs =
                parse_u64("CONCORD_HEALTH_METRICS_RETENTION_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_HEALTH_SIGNIFICANT_DELTA") {
            self.health.significant_delta = parse_f64("CONCORD_HEALTH_SIGNIFICANT_DELTA", &value)?;
        }

        if let Some(value) = read_env("CONCORD_STORAGE_DATABASE_URL") {
            self.storage.database_url = value;
        }
        if let Some(value) = read_env("CONCORD_STORAGE_MAX_CONNECTIONS") {
            self.storage.max_connections = parse_u32("CONCORD_STORAGE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_STORAGE_TIMEOUT_SECS") {
            self.storage.timeout_secs = parse_u64("CONCORD_STORAGE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCORD_STORAGE_LOCK_PATH") {
            self.storage.lock_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("CONCORD_STORAGE_INCIDENT_LOG_PATH") {
            self.storage.incident_log_path = PathBuf::from(value);
        }

        if let Some(value) = read_env("CONCORD_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCORD_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("CONCORD_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("CONCORD_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CONCORD_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CONCORD_LOGGING_LEVEL").or_else(|| read_env("CONCORD_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCORD_LOGGING_FORMAT").or_else(|| read_env("CONCORD_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.storage.database_url = database_url;
        }
        if let Some(lock_path) = overrides.lock_path {
            self.storage.lock_path = lock_path;
        }
        if let Some(incident_log_path) = overrides.incident_log_path {
            self.storage.incident_log_path = incident_log_path;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(max_turns) = overrides.max_turns {
            self.dialogue.max_turns = max_turns;
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.dialogue.max_tokens = max_tokens;
        }
        if let Some(health_check_port) = overrides.health_check_port {
            self.server.health_check_port = health_check_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_dialogue(&self.dialogue)?;
        validate_safety(&self.safety)?;
        validate_memory(&self.memory)?;
        validate_health(&self.health)?;
        validate_storage(&self.storage)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concord.toml"), PathBuf::from("config/concord.toml")]
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

fn require_positive_secs(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
    }
    Ok(())
}

fn require_positive_threshold(key: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "{key} must be a finite number greater than zero"
        )));
    }
    Ok(())
}

fn validate_dialogue(dialogue: &DialogueSettings) -> Result<(), ConfigError> {
    if dialogue.max_turns == 0 {
        return Err(ConfigError::Validation(
            "dialogue.max_turns must be greater than zero".to_string(),
        ));
    }
    if dialogue.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "dialogue.max_tokens must be greater than zero".to_string(),
        ));
    }
    if dialogue.token_divisor == 0 {
        return Err(ConfigError::Validation(
            "dialogue.token_divisor must be greater than zero".to_string(),
        ));
    }
    require_positive_secs("dialogue.max_duration_secs", dialogue.max_duration_secs)?;
    require_positive_secs("dialogue.checksum_interval_secs", dialogue.checksum_interval_secs)?;
    Ok(())
}

fn validate_safety(safety: &SafetySettings) -> Result<(), ConfigError> {
    require_positive_threshold("safety.cost_threshold", safety.cost_threshold)?;
    require_positive_threshold("safety.token_rate_threshold", safety.token_rate_threshold)?;
    require_positive_secs("safety.cost_window_secs", safety.cost_window_secs)?;
    require_positive_secs("safety.check_interval_secs", safety.check_interval_secs)?;

    for (key, value) in [
        ("safety.cpu_threshold", safety.cpu_threshold),
        ("safety.memory_threshold", safety.memory_threshold),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            return Err(ConfigError::Validation(format!(
                "{key} is a percentage and must be in range (0, 100]"
            )));
        }
    }

    Ok(())
}

fn validate_memory(memory: &MemorySettings) -> Result<(), ConfigError> {
    require_positive_secs("memory.integrity_interval_secs", memory.integrity_interval_secs)?;
    if memory.embedding_dimensions == 0 || memory.embedding_dimensions > 4_096 {
        return Err(ConfigError::Validation(
            "memory.embedding_dimensions must be in range 1..=4096".to_string(),
        ));
    }
    Ok(())
}

fn validate_health(health: &HealthSettings) -> Result<(), ConfigError> {
    require_positive_secs("health.heartbeat_interval_secs", health.heartbeat_interval_secs)?;
    require_positive_secs("health.health_check_interval_secs", health.health_check_interval_secs)?;
    require_positive_secs("health.metrics_retention_secs", health.metrics_retention_secs)?;
    if !health.significant_delta.is_finite() || health.significant_delta < 0.0 {
        return Err(ConfigError::Validation(
            "health.significant_delta must be a finite, non-negative number".to_string(),
        ));
    }
    Ok(())
}

fn validate_storage(storage: &StorageConfig) -> Result<(), ConfigError> {
    let url = storage.database_url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "storage.database_url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if storage.max_connections == 0 {
        return Err(ConfigError::Validation(
            "storage.max_connections must be greater than zero".to_string(),
        ));
    }

    if storage.timeout_secs == 0 || storage.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "storage.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if storage.lock_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "storage.lock_path is required; the act-mode lock must survive restarts".to_string(),
        ));
    }
    if storage.incident_log_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("storage.incident_log_path is required".to_string()));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
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

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    dialogue: Option<DialoguePatch>,
    safety: Option<SafetyPatch>,
    memory: Option<MemoryPatch>,
    health: Option<HealthPatch>,
    storage: Option<StoragePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DialoguePatch {
    max_turns: Option<u32>,
    max_tokens: Option<u64>,
    max_duration_secs: Option<u64>,
    checksum_interval_secs: Option<u64>,
    token_divisor: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SafetyPatch {
    cost_threshold: Option<f64>,
    cost_window_secs: Option<u64>,
    cpu_threshold: Option<f64>,
    memory_threshold: Option<f64>,
    token_rate_threshold: Option<f64>,
    check_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    integrity_interval_secs: Option<u64>,
    embedding_dimensions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct HealthPatch {
    heartbeat_interval_secs: Option<u64>,
    health_check_interval_secs: Option<u64>,
    metrics_retention_secs: Option<u64>,
    significant_delta: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct StoragePatch {
    database_url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    lock_path: Option<PathBuf>,
    incident_log_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
