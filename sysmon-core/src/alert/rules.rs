//! Alert rule types and the YAML loader for the textual configuration
//! described below.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Above,
    Below,
    Equals,
}

impl Condition {
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::Above => value > threshold,
            Condition::Below => value < threshold,
            Condition::Equals => (value - threshold).abs() < 1e-3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Webhook,
    Email,
}

/// A compiled, runtime alert rule. `process_name` selects scope: absent ⇒
/// whole-system rule; `"*"` ⇒ any process, one instance per pid; any other
/// value ⇒ exact process-name match (the pinned resolution for the
/// ambiguous `"*"` handling in the source).
#[derive(Clone, Debug, PartialEq)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    pub metric_type: String,
    pub condition: Condition,
    pub threshold: f64,
    pub duration_required: Duration,
    pub severity: Severity,
    pub cooldown: Duration,
    pub sinks: Vec<String>,
    pub process_name: Option<String>,
}

/// Identity used to decide whether a reloaded rule is "the same rule" for
/// the purpose of preserving `AlertInstance` timers (the pinned
/// resolution: "preserved if name + metric + threshold + condition +
/// duration is unchanged; reset otherwise").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleIdentity {
    pub name: String,
    pub metric_type: String,
    pub threshold_bits: u64,
    pub condition: Condition,
    pub duration_required: Duration,
}

impl AlertRule {
    pub fn identity(&self) -> RuleIdentity {
        RuleIdentity {
            name: self.name.clone(),
            metric_type: self.metric_type.clone(),
            threshold_bits: self.threshold.to_bits(),
            condition: self.condition,
            duration_required: self.duration_required,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_check_interval() -> u64 {
    5
}
fn default_cooldown() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
            cooldown_seconds: default_cooldown(),
            enabled: default_true(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RawSinkConfig {
    pub kind: SinkKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
struct RawAlertConfig {
    name: String,
    #[serde(default)]
    description: String,
    metric: String,
    condition: Condition,
    threshold: f64,
    duration: u64,
    severity: Severity,
    #[serde(default)]
    notifications: Vec<String>,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default)]
    cooldown_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    global: GlobalConfig,
    #[serde(default)]
    notifications: HashMap<String, RawSinkConfig>,
    #[serde(default)]
    alerts: Vec<RawAlertConfig>,
    #[serde(default)]
    process_alerts: Vec<RawAlertConfig>,
}

pub struct LoadedConfig {
    pub global: GlobalConfig,
    pub rules: Vec<AlertRule>,
    pub sinks: HashMap<String, RawSinkConfig>,
}

/// Parses and validates the YAML alert configuration. Rejects the entire
/// document on any structural or referential error (unknown sink name,
/// duplicate rule name) — no partial loads.
pub fn load_from_str(yaml: &str) -> Result<LoadedConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml)?;

    let mut rules = Vec::new();
    let mut seen_names = std::collections::HashSet::new();

    for raw_rule in raw.alerts.iter().chain(raw.process_alerts.iter()) {
        if !seen_names.insert(raw_rule.name.clone()) {
            return Err(ConfigError::Referential(format!("duplicate rule name: {}", raw_rule.name)));
        }
        for sink_name in &raw_rule.notifications {
            if !raw.notifications.contains_key(sink_name) {
                return Err(ConfigError::Referential(format!(
                    "rule '{}' references unknown sink '{}'",
                    raw_rule.name, sink_name
                )));
            }
        }
        rules.push(AlertRule {
            name: raw_rule.name.clone(),
            description: raw_rule.description.clone(),
            metric_type: raw_rule.metric.clone(),
            condition: raw_rule.condition,
            threshold: raw_rule.threshold,
            duration_required: Duration::from_secs(raw_rule.duration),
            severity: raw_rule.severity,
            cooldown: Duration::from_secs(raw_rule.cooldown_seconds.unwrap_or(raw.global.cooldown_seconds)),
            sinks: raw_rule.notifications.clone(),
            process_name: raw_rule.process_name.clone(),
        });
    }

    Ok(LoadedConfig { global: raw.global, rules, sinks: raw.notifications })
}

pub fn load_from_path(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_from_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
global:
  check_interval_seconds: 5
  cooldown_seconds: 60
  enabled: true

notifications:
  console:
    kind: log
    enabled: true
    config:
      path: /tmp/alerts.log

alerts:
  - name: high_cpu
    description: CPU usage too high
    metric: cpu.total_usage
    condition: above
    threshold: 50
    duration: 3
    severity: warning
    notifications: [console]

process_alerts:
  - name: runaway_process
    description: Any process using too much CPU
    metric: process.cpu_percent
    condition: above
    threshold: 90
    duration: 10
    severity: critical
    notifications: [console]
    process_name: "*"
"#;

    #[test]
    fn parses_sample_config() {
        let loaded = load_from_str(SAMPLE).unwrap();
        assert_eq!(loaded.rules.len(), 2);
        assert_eq!(loaded.global.cooldown_seconds, 60);
        let cpu_rule = loaded.rules.iter().find(|r| r.name == "high_cpu").unwrap();
        assert_eq!(cpu_rule.threshold, 50.0);
        assert_eq!(cpu_rule.process_name, None);
        let proc_rule = loaded.rules.iter().find(|r| r.name == "runaway_process").unwrap();
        assert_eq!(proc_rule.process_name.as_deref(), Some("*"));
    }

    #[test]
    fn per_rule_cooldown_overrides_global() {
        let yaml = r#"
global:
  cooldown_seconds: 300
notifications:
  console:
    kind: log
    config: {}
alerts:
  - name: custom_cooldown
    metric: m
    condition: above
    threshold: 1
    duration: 0
    severity: info
    notifications: [console]
    cooldown_seconds: 30
  - name: default_cooldown
    metric: m2
    condition: above
    threshold: 1
    duration: 0
    severity: info
    notifications: [console]
"#;
        let loaded = load_from_str(yaml).unwrap();
        let custom = loaded.rules.iter().find(|r| r.name == "custom_cooldown").unwrap();
        let default = loaded.rules.iter().find(|r| r.name == "default_cooldown").unwrap();
        assert_eq!(custom.cooldown, Duration::from_secs(30));
        assert_eq!(default.cooldown, Duration::from_secs(300));
    }

    #[test]
    fn rejects_unknown_sink_reference() {
        let yaml = SAMPLE.replace("console", "nosuchsink");
        // Only break the alert's reference, leave the sink definition intact
        // by re-adding a valid notifications block.
        let broken = format!(
            "global:\n  cooldown_seconds: 60\nnotifications:\n  console:\n    kind: log\n    config: {{}}\nalerts:\n  - name: x\n    metric: m\n    condition: above\n    threshold: 1\n    duration: 0\n    severity: info\n    notifications: [nosuchsink]\n"
        );
        let _ = yaml;
        assert!(load_from_str(&broken).is_err());
    }

    #[test]
    fn rejects_duplicate_rule_names() {
        let yaml = r#"
notifications:
  console:
    kind: log
    config: {}
alerts:
  - name: dup
    metric: m
    condition: above
    threshold: 1
    duration: 0
    severity: info
    notifications: [console]
  - name: dup
    metric: m2
    condition: above
    threshold: 2
    duration: 0
    severity: info
    notifications: [console]
"#;
        assert!(load_from_str(yaml).is_err());
    }
}
