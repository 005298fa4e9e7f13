//! Agent and aggregator configuration trees, loaded from YAML
//! with `#[serde(default)]` on every optional field.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_mode() -> String {
    "local".to_owned()
}
fn default_collection_interval_ms() -> u64 {
    1000
}
fn default_push_interval_ms() -> u64 {
    5000
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_http_timeout_ms() -> u64 {
    10_000
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retention_days() -> i64 {
    30
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_seconds() -> u64 {
    5
}
fn default_db_path() -> String {
    "~/.sysmon/data.db".to_owned()
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_seconds")]
    pub flush_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            batch_size: default_batch_size(),
            flush_seconds: default_flush_seconds(),
        }
    }
}

/// Operating mode: `local` samples and stores only; `distributed` pushes to
/// an aggregator and may skip the local store; `hybrid` runs both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentMode {
    Local,
    Distributed,
    Hybrid,
}

impl std::str::FromStr for AgentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(AgentMode::Local),
            "distributed" => Ok(AgentMode::Distributed),
            "hybrid" => Ok(AgentMode::Hybrid),
            other => Err(ConfigError::Referential(format!("unknown agent mode '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_collection_interval_ms")]
    pub collection_interval_ms: u64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,

    #[serde(default)]
    pub aggregator_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_push_interval_ms")]
    pub push_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub alert_rules_path: Option<String>,
}

impl AgentConfig {
    pub fn mode(&self) -> Result<AgentMode, ConfigError> {
        self.mode.parse()
    }

    /// Validates the cross-field requirement that distributed/hybrid modes
    /// carry an aggregator URL and token.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mode = self.mode()?;
        if matches!(mode, AgentMode::Distributed | AgentMode::Hybrid) {
            if self.aggregator_url.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Referential("aggregator_url is required in distributed/hybrid mode".into()));
            }
            if self.auth_token.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Referential("auth_token is required in distributed/hybrid mode".into()));
            }
        }
        Ok(())
    }

    pub fn resolved_hostname(&self) -> String {
        if self.hostname.is_empty() {
            gethostname::gethostname().to_string_lossy().into_owned()
        } else {
            self.hostname.clone()
        }
    }

    pub fn expanded_db_path(&self) -> std::path::PathBuf {
        expand_home(&self.storage.db_path)
    }
}

fn default_aggregator_bind() -> String {
    "0.0.0.0:8090".to_owned()
}
fn default_aggregator_db_path() -> String {
    "~/.sysmon/aggregator.db".to_owned()
}
fn default_inactive_threshold_seconds() -> i64 {
    300
}

#[derive(Clone, Debug, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_aggregator_bind")]
    pub bind_addr: String,
    #[serde(default)]
    pub ingest_token: Option<String>,
    #[serde(default = "default_aggregator_db_path")]
    pub db_path: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_inactive_threshold_seconds")]
    pub inactive_threshold_seconds: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_aggregator_bind(),
            ingest_token: None,
            db_path: default_aggregator_db_path(),
            retention_days: default_retention_days(),
            inactive_threshold_seconds: default_inactive_threshold_seconds(),
        }
    }
}

impl AggregatorConfig {
    pub fn expanded_db_path(&self) -> std::path::PathBuf {
        expand_home(&self.db_path)
    }
}

/// Expands a leading `~/` to the user's home directory; paths without it
/// pass through unchanged.
fn expand_home(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return std::path::PathBuf::from(home).join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

pub fn load_agent_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: AgentConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn load_aggregator_config(path: &Path) -> Result<AggregatorConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: AggregatorConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_local_config() {
        let yaml = "mode: local\ncollection_interval_ms: 500\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mode().unwrap(), AgentMode::Local);
        assert_eq!(config.collection_interval_ms, 500);
        assert_eq!(config.queue_capacity, default_queue_capacity());
        config.validate().unwrap();
    }

    #[test]
    fn distributed_mode_requires_aggregator_url_and_token() {
        let yaml = "mode: distributed\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn distributed_mode_with_url_and_token_validates() {
        let yaml = "mode: distributed\naggregator_url: http://agg:8090\nauth_token: secret\n";
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn expand_home_replaces_tilde_prefix() {
        std::env::set_var("HOME", "/home/tester");
        let expanded = expand_home("~/.sysmon/data.db");
        assert_eq!(expanded, std::path::PathBuf::from("/home/tester/.sysmon/data.db"));
    }

    #[test]
    fn aggregator_config_has_expected_defaults() {
        let config = AggregatorConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8090");
        assert_eq!(config.inactive_threshold_seconds, 300);
    }
}
