//! Alert rule configuration, the Normal/Armed/Firing/Cooldown state
//! machine, and the notification sinks that deliver fired events.

pub mod engine;
pub mod rules;
pub mod sinks;

pub use engine::{AlertEngine, AlertEvent, AlertInstance, AlertState};
pub use rules::{AlertRule, Condition, GlobalConfig, LoadedConfig, RawSinkConfig, Severity, SinkKind};
pub use sinks::{build_sink, AsyncWebhookSink, EmailSink, LogSink, NotificationSink, WebhookSink};
