//! The per-rule alert state machine and the `AlertEngine` that drives it
//! from Collector snapshots.
//!
//! State machine: `Normal -> Armed -> Firing -> Cooldown -> Normal`. A
//! breach arms the timer; the timer must hold for `duration_required`
//! before the rule fires. `duration_required == 0` fires on the very
//! first breach. Once firing, the rule will not fire again until
//! `cooldown` elapses, except `cooldown == 0`, which re-fires on every
//! still-breaching observation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::sample::MetricSample;

use super::rules::{AlertRule, Condition, LoadedConfig, Severity};
use super::sinks::NotificationSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertState {
    Normal,
    Armed,
    Firing,
    Cooldown,
}

#[derive(Clone, Debug)]
pub struct AlertInstance {
    pub state: AlertState,
    pub armed_at: Option<Instant>,
    pub last_fired_at: Option<Instant>,
    pub last_observed_value: Option<f64>,
}

impl Default for AlertInstance {
    fn default() -> Self {
        Self { state: AlertState::Normal, armed_at: None, last_fired_at: None, last_observed_value: None }
    }
}

/// One firing of a rule, handed to every configured sink.
#[derive(Clone, Debug, Serialize)]
pub struct AlertEvent {
    pub rule_name: String,
    pub metric_type: String,
    pub condition: Condition,
    pub threshold: f64,
    pub severity: Severity,
    pub fired_at: i64,
    pub hostname: String,
    pub observed_value: f64,
    pub message: String,
    pub pid: Option<u32>,
}

impl AlertEvent {
    pub fn severity_label(&self) -> &'static str {
        match self.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Extracts `(metric_type, value, entity_key, process_name)` tuples from a
/// snapshot sample. `entity_key` distinguishes per-process, per-disk, and
/// per-interface instances (e.g. pid as a string, device name, interface
/// name); `None` for whole-system families (cpu, memory). Generalizing
/// instancing beyond per-process families is a local design decision, not
/// spelled out in the original config format: disks and networks are
/// list-valued in exactly the same shape that processes are, so the same
/// one-instance-per-entity rule applies uniformly.
pub fn metric_candidates(sample: &MetricSample) -> (f64, Option<String>, Option<String>) {
    let entity_key = sample.tags.get("device").or_else(|| sample.tags.get("interface")).or_else(|| sample.tags.get("pid")).cloned();
    let process_name = sample.tags.get("process_name").cloned();
    (sample.value, entity_key, process_name)
}

fn instance_key(rule_name: &str, entity_key: &Option<String>) -> (String, Option<String>) {
    (rule_name.to_owned(), entity_key.clone())
}

/// Advances one `AlertInstance` given a fresh observation. Returns
/// `Some(AlertEvent)` exactly when this observation causes the rule to
/// fire.
#[allow(clippy::too_many_arguments)]
fn step(
    instance: &mut AlertInstance,
    rule: &AlertRule,
    value: f64,
    now: Instant,
    now_unix: i64,
    hostname: &str,
    pid: Option<u32>,
) -> Option<AlertEvent> {
    instance.last_observed_value = Some(value);
    let breaching = rule.condition.breaches(value, rule.threshold);

    match instance.state {
        AlertState::Normal => {
            if !breaching {
                return None;
            }
            if rule.duration_required.is_zero() {
                instance.state = AlertState::Firing;
                instance.last_fired_at = Some(now);
                return Some(build_event(rule, value, now_unix, hostname, pid));
            }
            instance.state = AlertState::Armed;
            instance.armed_at = Some(now);
            None
        }
        AlertState::Armed => {
            if !breaching {
                instance.state = AlertState::Normal;
                instance.armed_at = None;
                return None;
            }
            let armed_at = instance.armed_at.unwrap_or(now);
            if now.duration_since(armed_at) >= rule.duration_required {
                instance.state = AlertState::Firing;
                instance.last_fired_at = Some(now);
                return Some(build_event(rule, value, now_unix, hostname, pid));
            }
            None
        }
        AlertState::Firing => {
            if !breaching {
                instance.state = AlertState::Normal;
                instance.armed_at = None;
                return None;
            }
            if rule.cooldown.is_zero() {
                instance.last_fired_at = Some(now);
                return Some(build_event(rule, value, now_unix, hostname, pid));
            }
            instance.state = AlertState::Cooldown;
            None
        }
        AlertState::Cooldown => {
            let last_fired = instance.last_fired_at.unwrap_or(now);
            let cooldown_elapsed = now.duration_since(last_fired) >= rule.cooldown;
            if !breaching {
                instance.state = AlertState::Normal;
                instance.armed_at = None;
                return None;
            }
            if cooldown_elapsed {
                instance.state = AlertState::Firing;
                instance.last_fired_at = Some(now);
                return Some(build_event(rule, value, now_unix, hostname, pid));
            }
            None
        }
    }
}

fn build_event(rule: &AlertRule, value: f64, now_unix: i64, hostname: &str, pid: Option<u32>) -> AlertEvent {
    let comparator = match rule.condition {
        Condition::Above => "above",
        Condition::Below => "below",
        Condition::Equals => "equal to",
    };
    AlertEvent {
        rule_name: rule.name.clone(),
        metric_type: rule.metric_type.clone(),
        condition: rule.condition,
        threshold: rule.threshold,
        severity: rule.severity,
        fired_at: now_unix,
        hostname: hostname.to_owned(),
        observed_value: value,
        message: format!("{} is {} threshold {} (observed {})", rule.metric_type, comparator, rule.threshold, value),
        pid,
    }
}

/// Owns the active rule set and per-instance state, and drives both from
/// Collector samples. Rule reloads swap the whole rule set atomically;
/// instances whose `RuleIdentity` is unchanged keep their timers;
/// everything else starts fresh in `Normal`.
pub struct AlertEngine {
    rules: Mutex<Arc<Vec<AlertRule>>>,
    instances: Mutex<HashMap<(String, Option<String>), AlertInstance>>,
    sinks: Mutex<HashMap<String, Arc<dyn NotificationSink>>>,
    hostname: String,
}

impl AlertEngine {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            rules: Mutex::new(Arc::new(Vec::new())),
            instances: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            hostname: hostname.into(),
        }
    }

    /// Loads rules from a YAML file, preserving instance state for rules
    /// whose identity is unchanged from the previous load.
    pub fn load_rules(&self, path: &Path) -> Result<LoadedConfig, ConfigError> {
        let loaded = super::rules::load_from_path(path)?;
        self.replace_rules(loaded.rules.clone());
        Ok(loaded)
    }

    pub fn replace_rules(&self, new_rules: Vec<AlertRule>) {
        let old_identities: std::collections::HashSet<_> = {
            let current = self.rules.lock().unwrap();
            current.iter().map(|r| r.identity()).collect()
        };
        let new_identities: std::collections::HashSet<_> = new_rules.iter().map(|r| r.identity()).collect();
        let preserved_names: std::collections::HashSet<&str> = old_identities
            .intersection(&new_identities)
            .map(|identity| identity.name.as_str())
            .collect();

        {
            let mut instances = self.instances.lock().unwrap();
            instances.retain(|(rule_name, _), _| preserved_names.contains(rule_name.as_str()));
        }

        let dropped = old_identities.difference(&new_identities).count();
        if dropped > 0 {
            debug!(dropped, "alert rule identities changed on reload, resetting their instance timers");
        }

        *self.rules.lock().unwrap() = Arc::new(new_rules);
    }

    pub fn register_sink(&self, name: impl Into<String>, sink: Arc<dyn NotificationSink>) {
        self.sinks.lock().unwrap().insert(name.into(), sink);
    }

    pub fn unregister_sink(&self, name: &str) {
        self.sinks.lock().unwrap().remove(name);
    }

    pub fn active_rules(&self) -> Arc<Vec<AlertRule>> {
        self.rules.lock().unwrap().clone()
    }

    /// Feeds one metric sample through every rule whose `metric_type`
    /// matches, dispatching to configured sinks on fire. `now` is an
    /// `Instant` for state-machine timing; `now_unix` is the wall-clock
    /// timestamp recorded on the fired event.
    pub fn ingest(&self, sample: &MetricSample, now: Instant, now_unix: i64) {
        let rules = self.active_rules();
        let (value, entity_key, process_name) = metric_candidates(sample);

        for rule in rules.iter() {
            if rule.metric_type != sample.metric_type {
                continue;
            }

            let matches_scope = match (&rule.process_name, &process_name) {
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(_), None) => false,
                (Some(wanted), Some(actual)) => wanted == "*" || wanted == actual,
            };
            if !matches_scope {
                continue;
            }

            let key = instance_key(&rule.name, &entity_key);
            let pid = entity_key.as_ref().and_then(|k| k.parse::<u32>().ok());

            let event = {
                let mut instances = self.instances.lock().unwrap();
                let instance = instances.entry(key).or_default();
                step(instance, rule, value, now, now_unix, &self.hostname, if process_name.is_some() { pid } else { None })
            };

            if let Some(event) = event {
                self.dispatch(rule, event);
            }
        }
    }

    fn dispatch(&self, rule: &AlertRule, event: AlertEvent) {
        let sinks = self.sinks.lock().unwrap();
        for sink_name in &rule.sinks {
            if let Some(sink) = sinks.get(sink_name) {
                if let Err(e) = sink.send(&event) {
                    tracing::warn!(sink = %sink_name, error = %e, "alert sink delivery failed");
                }
            }
        }
        info!(rule = %event.rule_name, severity = %event.severity_label(), value = event.observed_value, "alert fired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rule(duration_secs: u64, cooldown_secs: u64) -> AlertRule {
        AlertRule {
            name: "high_cpu".into(),
            description: String::new(),
            metric_type: "cpu.total_usage".into(),
            condition: Condition::Above,
            threshold: 80.0,
            duration_required: Duration::from_secs(duration_secs),
            severity: Severity::Warning,
            cooldown: Duration::from_secs(cooldown_secs),
            sinks: vec![],
            process_name: None,
        }
    }

    fn sample(value: f64) -> MetricSample {
        MetricSample { timestamp: 0, metric_type: "cpu.total_usage".into(), host: "h1".into(), value, tags: BTreeMap::new() }
    }

    #[test]
    fn duration_zero_fires_on_first_breach() {
        let r = rule(0, 300);
        let mut inst = AlertInstance::default();
        let now = Instant::now();
        let event = step(&mut inst, &r, 90.0, now, 0, "h1", None);
        assert!(event.is_some());
        assert_eq!(inst.state, AlertState::Firing);
    }

    #[test]
    fn duration_required_arms_then_fires_after_hold() {
        let r = rule(5, 300);
        let mut inst = AlertInstance::default();
        let t0 = Instant::now();
        assert!(step(&mut inst, &r, 90.0, t0, 0, "h1", None).is_none());
        assert_eq!(inst.state, AlertState::Armed);

        let t1 = t0 + Duration::from_secs(2);
        assert!(step(&mut inst, &r, 90.0, t1, 0, "h1", None).is_none());
        assert_eq!(inst.state, AlertState::Armed);

        let t2 = t0 + Duration::from_secs(6);
        let event = step(&mut inst, &r, 90.0, t2, 0, "h1", None);
        assert!(event.is_some());
        assert_eq!(inst.state, AlertState::Firing);
    }

    #[test]
    fn breach_clearing_during_armed_resets_to_normal() {
        let r = rule(5, 300);
        let mut inst = AlertInstance::default();
        let t0 = Instant::now();
        step(&mut inst, &r, 90.0, t0, 0, "h1", None);
        assert_eq!(inst.state, AlertState::Armed);

        let t1 = t0 + Duration::from_secs(1);
        step(&mut inst, &r, 50.0, t1, 0, "h1", None);
        assert_eq!(inst.state, AlertState::Normal);
    }

    #[test]
    fn cooldown_zero_refires_every_breaching_observation() {
        let r = rule(0, 0);
        let mut inst = AlertInstance::default();
        let t0 = Instant::now();
        assert!(step(&mut inst, &r, 90.0, t0, 0, "h1", None).is_some());

        let t1 = t0 + Duration::from_millis(10);
        assert!(step(&mut inst, &r, 91.0, t1, 0, "h1", None).is_some());
    }

    #[test]
    fn nonzero_cooldown_suppresses_refire_until_elapsed() {
        let r = rule(0, 60);
        let mut inst = AlertInstance::default();
        let t0 = Instant::now();
        assert!(step(&mut inst, &r, 90.0, t0, 0, "h1", None).is_some());
        assert_eq!(inst.state, AlertState::Firing);

        let t1 = t0 + Duration::from_secs(1);
        assert!(step(&mut inst, &r, 95.0, t1, 0, "h1", None).is_none());
        assert_eq!(inst.state, AlertState::Cooldown);

        let t2 = t0 + Duration::from_secs(61);
        assert!(step(&mut inst, &r, 95.0, t2, 0, "h1", None).is_some());
    }

    #[test]
    fn breach_clearing_during_cooldown_resets_to_normal() {
        let r = rule(0, 60);
        let mut inst = AlertInstance::default();
        let t0 = Instant::now();
        step(&mut inst, &r, 90.0, t0, 0, "h1", None);
        let t1 = t0 + Duration::from_secs(1);
        step(&mut inst, &r, 95.0, t1, 0, "h1", None);
        assert_eq!(inst.state, AlertState::Cooldown);

        let t2 = t0 + Duration::from_secs(2);
        step(&mut inst, &r, 10.0, t2, 0, "h1", None);
        assert_eq!(inst.state, AlertState::Normal);
    }

    #[test]
    fn engine_ingest_dispatches_to_registered_sink() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingSink(Arc<AtomicUsize>);
        impl NotificationSink for CountingSink {
            fn kind(&self) -> &'static str {
                "log"
            }
            fn send(&self, _event: &AlertEvent) -> Result<(), crate::error::SinkError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let engine = AlertEngine::new("host1");
        let counter = Arc::new(AtomicUsize::new(0));
        engine.register_sink("console", Arc::new(CountingSink(counter.clone())));

        let mut rule = rule(0, 300);
        rule.sinks = vec!["console".into()];
        engine.replace_rules(vec![rule]);

        let now = Instant::now();
        engine.ingest(&sample(95.0), now, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_process_rule_tracks_separate_instance_per_pid() {
        let mut rule = rule(0, 300);
        rule.metric_type = "process.cpu_percent".into();
        rule.process_name = Some("*".into());

        let engine = AlertEngine::new("host1");
        engine.replace_rules(vec![rule]);

        let mut tags_a = BTreeMap::new();
        tags_a.insert("pid".to_owned(), "100".to_owned());
        tags_a.insert("process_name".to_owned(), "worker".to_owned());
        let sample_a = MetricSample { timestamp: 0, metric_type: "process.cpu_percent".into(), host: "host1".into(), value: 95.0, tags: tags_a };

        let mut tags_b = BTreeMap::new();
        tags_b.insert("pid".to_owned(), "200".to_owned());
        tags_b.insert("process_name".to_owned(), "worker".to_owned());
        let sample_b = MetricSample { timestamp: 0, metric_type: "process.cpu_percent".into(), host: "host1".into(), value: 10.0, tags: tags_b };

        let now = Instant::now();
        engine.ingest(&sample_a, now, 0);
        engine.ingest(&sample_b, now, 0);

        let instances = engine.instances.lock().unwrap();
        let a = instances.get(&("high_cpu".to_owned(), Some("100".to_owned()))).unwrap();
        let b = instances.get(&("high_cpu".to_owned(), Some("200".to_owned()))).unwrap();
        assert_eq!(a.state, AlertState::Firing);
        assert_eq!(b.state, AlertState::Normal);
    }
}
