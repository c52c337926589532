use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concord_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value) in effective_values(&config) {
        let source = field_source(key_path, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    let dialogue = &config.dialogue;
    let safety = &config.safety;
    let health = &config.health;
    let storage = &config.storage;

    vec![
        ("dialogue.max_turns", dialogue.max_turns.to_string()),
        ("dialogue.max_tokens", dialogue.max_tokens.to_string()),
        ("dialogue.max_duration_secs", dialogue.max_duration_secs.to_string()),
        ("dialogue.checksum_interval_secs", dialogue.checksum_interval_secs.to_string()),
        ("dialogue.token_divisor", dialogue.token_divisor.to_string()),
        ("safety.cost_threshold", safety.cost_threshold.to_string()),
        ("safety.cost_window_secs", safety.cost_window_secs.to_string()),
        ("safety.cpu_threshold", safety.cpu_threshold.to_string()),
        ("safety.memory_threshold", safety.memory_threshold.to_string()),
        ("safety.token_rate_threshold", safety.token_rate_threshold.to_string()),
        ("safety.check_interval_secs", safety.check_interval_secs.to_string()),
        ("memory.integrity_interval_secs", config.memory.integrity_interval_secs.to_string()),
        ("memory.embedding_dimensions", config.memory.embedding_dimensions.to_string()),
        ("health.heartbeat_interval_secs", health.heartbeat_interval_secs.to_string()),
        ("health.health_check_interval_secs", health.health_check_interval_secs.to_string()),
        ("health.metrics_retention_secs", health.metrics_retention_secs.to_string()),
        ("health.significant_delta", health.significant_delta.to_string()),
        ("storage.database_url", storage.database_url.clone()),
        ("storage.max_connections", storage.max_connections.to_string()),
        ("storage.timeout_secs", storage.timeout_secs.to_string()),
        ("storage.lock_path", storage.lock_path.display().to_string()),
        ("storage.incident_log_path", storage.incident_log_path.display().to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.health_check_port", config.server.health_check_port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ]
}

/// `storage.lock_path` is overridden by `CONCORD_STORAGE_LOCK_PATH`.
fn env_key(key_path: &str) -> String {
    match key_path {
        "health.health_check_interval_secs" => "CONCORD_HEALTH_CHECK_INTERVAL_SECS".to_string(),
        _ => format!("CONCORD_{}", key_path.replace('.', "_").to_ascii_uppercase()),
    }
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("concord.toml"), PathBuf::from("config/concord.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let env_key = env_key(key_path);
    if env::var_os(&env_key).is_some() {
        return format!("env ({env_key})");
    }
    if key_path.starts_with("logging.") {
        let alias = env_key.replace("LOGGING_", "LOG_");
        if env::var_os(&alias).is_some() {
            return format!("env ({alias})");
        }
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

#[cfg(test)]
mod tests {
    use super::{contains_path, env_key};

    #[test]
    fn env_keys_follow_the_section_prefix_convention() {
        assert_eq!(env_key("storage.lock_path"), "CONCORD_STORAGE_LOCK_PATH");
        assert_eq!(env_key("health.health_check_interval_secs"), "CONCORD_HEALTH_CHECK_INTERVAL_SECS");
    }

    #[test]
    fn contains_path_walks_nested_tables() {
        let doc: toml::Value = "[safety]\ncpu_threshold = 70.0\n".parse().expect("valid toml");
        assert!(contains_path(&doc, "safety.cpu_threshold"));
        assert!(!contains_path(&doc, "safety.memory_threshold"));
        assert!(!contains_path(&doc, "dialogue.max_turns"));
    }
}
