use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::procnet::DEFAULT_PROC_NET_DIR;

pub const CONFIG_FILENAME: &str = "vmpulse.toml";

const DEFAULT_TICK_MS: u64 = 3_000;
const DEFAULT_IPTABLES_IDLE_MS: u64 = 5_000;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WATCH_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_CONTROL_PROGRAM: &str = "vmpulse-hostagent";

const REQUIRED_FIELDS: &str = "[agent].tick_ms (integer), [agent].iptables_idle_ms (integer), [agent].proc_net_dir (string), [supervisor].startup_timeout_ms (integer), [supervisor].watch_timeout_ms (integer), [supervisor].poll_interval_ms (integer), [supervisor].control_program (string), [supervisor].control_args (array of strings)";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file ({}) is empty. Required fields: {}", .0.display(), REQUIRED_FIELDS)]
    Empty(PathBuf),
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config file ({}) is missing or invalid fields:\n- {}", .path.display(), .errors.join("\n- "))]
    Schema { path: PathBuf, errors: Vec<String> },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub tick_ms: u64,
    pub iptables_idle_ms: u64,
    pub proc_net_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            iptables_idle_ms: DEFAULT_IPTABLES_IDLE_MS,
            proc_net_dir: PathBuf::from(DEFAULT_PROC_NET_DIR),
        }
    }
}

impl AgentConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn iptables_idle(&self) -> Duration {
        Duration::from_millis(self.iptables_idle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub startup_timeout_ms: u64,
    pub watch_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub control_program: String,
    pub control_args: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            watch_timeout_ms: DEFAULT_WATCH_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            control_program: DEFAULT_CONTROL_PROGRAM.to_string(),
            control_args: Vec::new(),
        }
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILENAME)
}

/// Writes a default config to `path` unless one exists.
pub fn ensure_config_file(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let contents = toml::to_string_pretty(&Config::default())
        .map_err(|err| ConfigError::Invalid(format!("failed to render default config: {err}")))?;
    fs::write(path, contents).map_err(io_err)?;
    tracing::info!(path = %path.display(), "created vmpulse config");
    Ok(())
}

/// Loads `path`, creating it with defaults first when missing.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    ensure_config_file(path)?;
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), bytes = raw.len(), "loaded vmpulse config");
    parse_config(path, &raw)
}

pub fn parse_config(path: &Path, raw: &str) -> Result<Config, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let value: toml::Value = toml::from_str(trimmed).map_err(parse_err)?;
    let errors = validate_schema(&value);
    if !errors.is_empty() {
        return Err(ConfigError::Schema {
            path: path.to_path_buf(),
            errors,
        });
    }

    let config: Config = toml::from_str(trimmed).map_err(parse_err)?;
    validate(&config)?;
    Ok(config)
}

fn validate_schema(value: &toml::Value) -> Vec<String> {
    let mut errors = Vec::new();
    let root = match value.as_table() {
        Some(table) => table,
        None => {
            errors.push("config must be a table".to_string());
            return errors;
        }
    };

    match root.get("agent") {
        None => errors.push("missing [agent] table".to_string()),
        Some(value) => match value.as_table() {
            Some(table) => {
                validate_int(table, "tick_ms", "[agent].tick_ms (integer)", &mut errors);
                validate_int(
                    table,
                    "iptables_idle_ms",
                    "[agent].iptables_idle_ms (integer)",
                    &mut errors,
                );
                validate_string(
                    table,
                    "proc_net_dir",
                    "[agent].proc_net_dir (string)",
                    &mut errors,
                );
            }
            None => errors.push("[agent] must be a table".to_string()),
        },
    }

    match root.get("supervisor") {
        None => errors.push("missing [supervisor] table".to_string()),
        Some(value) => match value.as_table() {
            Some(table) => {
                for key in ["startup_timeout_ms", "watch_timeout_ms", "poll_interval_ms"] {
                    validate_int(
                        table,
                        key,
                        &format!("[supervisor].{key} (integer)"),
                        &mut errors,
                    );
                }
                validate_string(
                    table,
                    "control_program",
                    "[supervisor].control_program (string)",
                    &mut errors,
                );
                validate_string_array(
                    table,
                    "control_args",
                    "[supervisor].control_args (array of strings)",
                    &mut errors,
                );
            }
            None => errors.push("[supervisor] must be a table".to_string()),
        },
    }

    errors
}

fn validate_int(table: &toml::value::Table, key: &str, label: &str, errors: &mut Vec<String>) {
    match table.get(key) {
        None => errors.push(format!("missing {label}")),
        Some(value) => {
            if value.as_integer().is_none() {
                errors.push(format!("invalid {label}: expected integer"));
            }
        }
    }
}

fn validate_string(table: &toml::value::Table, key: &str, label: &str, errors: &mut Vec<String>) {
    match table.get(key) {
        None => errors.push(format!("missing {label}")),
        Some(value) => {
            if !value.is_str() {
                errors.push(format!("invalid {label}: expected string"));
            }
        }
    }
}

fn validate_string_array(
    table: &toml::value::Table,
    key: &str,
    label: &str,
    errors: &mut Vec<String>,
) {
    match table.get(key) {
        None => errors.push(format!("missing {label}")),
        Some(value) => match value.as_array() {
            Some(values) => {
                if values.iter().any(|value| !value.is_str()) {
                    errors.push(format!("invalid {label}: expected array of strings"));
                }
            }
            None => errors.push(format!("invalid {label}: expected array of strings")),
        },
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let durations = [
        ("agent.tick_ms", config.agent.tick_ms),
        ("agent.iptables_idle_ms", config.agent.iptables_idle_ms),
        ("supervisor.startup_timeout_ms", config.supervisor.startup_timeout_ms),
        ("supervisor.watch_timeout_ms", config.supervisor.watch_timeout_ms),
        ("supervisor.poll_interval_ms", config.supervisor.poll_interval_ms),
    ];
    for (name, value) in durations {
        if value == 0 {
            return Err(ConfigError::Invalid(format!("{name} must be >= 1")));
        }
    }
    if config.supervisor.control_program.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "supervisor.control_program must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let temp = TempDir::new().unwrap();
        let path = config_path(&temp.path().join("nested"));

        let config = load_config(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config, Config::default());
        assert_eq!(config.agent.tick(), Duration::from_secs(3));
        assert_eq!(config.agent.iptables_idle(), Duration::from_secs(5));
        assert_eq!(config.supervisor.watch_timeout_ms, 600_000);
    }

    #[test]
    fn empty_config_lists_required_fields() {
        let err = parse_config(Path::new("vmpulse.toml"), "  \n").unwrap_err();
        assert!(matches!(err, ConfigError::Empty(_)));
        assert!(err.to_string().contains("[agent].tick_ms"));
    }

    #[test]
    fn schema_errors_are_reported_together() {
        let raw = r#"
[agent]
tick_ms = "fast"
proc_net_dir = "/proc/net"

[supervisor]
startup_timeout_ms = 5000
watch_timeout_ms = 600000
poll_interval_ms = 100
control_program = "hostagent"
control_args = [1]
"#;
        let err = parse_config(Path::new("vmpulse.toml"), raw).unwrap_err();
        let ConfigError::Schema { errors, .. } = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&"invalid [agent].tick_ms (integer): expected integer".to_string()));
        assert!(errors.contains(&"missing [agent].iptables_idle_ms (integer)".to_string()));
        assert!(errors.iter().any(|e| e.contains("control_args")));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let mut config = Config::default();
        config.supervisor.poll_interval_ms = 0;
        let raw = toml::to_string_pretty(&config).unwrap();

        let err = parse_config(Path::new("vmpulse.toml"), &raw).unwrap_err();

        assert!(err.to_string().contains("supervisor.poll_interval_ms"));
    }

    #[test]
    fn custom_values_round_through_file() {
        let temp = TempDir::new().unwrap();
        let path = config_path(temp.path());
        let mut config = Config::default();
        config.agent.tick_ms = 500;
        config.supervisor.control_args = vec!["--debug".to_string()];
        fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(load_config(&path).unwrap(), config);
    }
}
