//! `NotificationSink`: polymorphic alert delivery. Built-in kinds are
//! `log` (rotating local file), `webhook` (HTTP POST via blocking reqwest),
//! and `email` (SMTP via lettre). New kinds are a module addition, not a
//! change to callers.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use tracing::warn;

use crate::error::SinkError;
use crate::ringqueue::RingQueue;

use super::engine::AlertEvent;
use super::rules::RawSinkConfig;

pub trait NotificationSink: Send + Sync {
    fn kind(&self) -> &'static str;
    fn send(&self, event: &AlertEvent) -> Result<(), SinkError>;
}

fn render_message(event: &AlertEvent) -> String {
    format!(
        "[{}] {} {} {} {} (observed={}, threshold={}) — {}",
        event.fired_at,
        event.severity_label(),
        event.hostname,
        event.rule_name,
        event.metric_type,
        event.observed_value,
        event.threshold,
        event.message
    )
}

/// Appends one line per event to a text file, rotating to a `.1` suffix
/// (single-generation, no compression) once the file exceeds `max_bytes`.
pub struct LogSink {
    path: PathBuf,
    max_bytes: u64,
    file: Mutex<File>,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, max_bytes, file: Mutex::new(file) })
    }

    fn rotate_if_needed(&self, guard: &mut File) -> Result<(), SinkError> {
        let size = guard.metadata()?.len();
        if size < self.max_bytes {
            return Ok(());
        }
        let backup = self.path.with_extension("log.1");
        let _ = fs::remove_file(&backup);
        fs::rename(&self.path, &backup)?;
        *guard = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }
}

impl NotificationSink for LogSink {
    fn kind(&self) -> &'static str {
        "log"
    }

    fn send(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let mut guard = self.file.lock().unwrap();
        self.rotate_if_needed(&mut guard)?;
        writeln!(guard, "{}", render_message(event))?;
        guard.flush()?;
        Ok(())
    }
}

/// POSTs a JSON payload to a configured URL. Performs one synchronous retry
/// on failure; longer retry policies belong in [`AsyncWebhookSink`].
pub struct WebhookSink {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Remote(e.to_string()))?;
        Ok(Self { url: url.into(), client })
    }

    fn post_once(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .map_err(|e| SinkError::Remote(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Remote(format!("webhook returned {}", response.status())))
        }
    }
}

impl NotificationSink for WebhookSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, event: &AlertEvent) -> Result<(), SinkError> {
        match self.post_once(event) {
            Ok(()) => Ok(()),
            Err(first_err) => {
                warn!(error = %first_err, "webhook sink first attempt failed, retrying once");
                self.post_once(event).map_err(|_| first_err)
            }
        }
    }
}

/// Owns its own worker thread and queue so a rule can opt into longer retry
/// policies without blocking the Collector thread.
pub struct AsyncWebhookSink {
    queue: Arc<RingQueue<AlertEvent>>,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AsyncWebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration, queue_capacity: usize) -> Self {
        let queue = Arc::new(RingQueue::new(queue_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let inner = WebhookSink::new(url, timeout).ok();
        let handle = {
            let queue = queue.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let batch = queue.pop_batch_wait(16, Duration::from_millis(500));
                    for event in batch {
                        if let Some(sink) = &inner {
                            if let Err(e) = sink.send(&event) {
                                warn!(error = %e, "async webhook delivery failed");
                            }
                        }
                    }
                }
            })
        };
        Self { queue, running, handle: Some(handle) }
    }
}

impl NotificationSink for AsyncWebhookSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, event: &AlertEvent) -> Result<(), SinkError> {
        self.queue
            .push(event.clone())
            .map_err(|_| SinkError::Remote("async webhook queue full".into()))
    }
}

impl Drop for AsyncWebhookSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Hands a rendered message to an SMTP transport. Deliverability is
/// best-effort; persistent failures are logged once then suppressed until
/// the transport recovers (tracked via `last_error_suppressed`).
pub struct EmailSink {
    from: String,
    to: String,
    smtp_host: String,
    credentials: Option<Credentials>,
    last_error_suppressed: AtomicBool,
}

impl EmailSink {
    pub fn new(from: impl Into<String>, to: impl Into<String>, smtp_host: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            smtp_host: smtp_host.into(),
            credentials,
            last_error_suppressed: AtomicBool::new(false),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, SinkError> {
        let mut builder = SmtpTransport::relay(&self.smtp_host).map_err(|e| SinkError::Remote(e.to_string()))?;
        if let Some(creds) = &self.credentials {
            builder = builder.credentials(creds.clone());
        }
        Ok(builder.build())
    }
}

impl NotificationSink for EmailSink {
    fn kind(&self) -> &'static str {
        "email"
    }

    fn send(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let message = Message::builder()
            .from(self.from.parse().map_err(|e: lettre::address::AddressError| SinkError::Remote(e.to_string()))?)
            .to(self.to.parse().map_err(|e: lettre::address::AddressError| SinkError::Remote(e.to_string()))?)
            .subject(format!("sysmon alert: {}", event.rule_name))
            .body(render_message(event))
            .map_err(|e| SinkError::Remote(e.to_string()))?;

        let transport = self.transport()?;
        match transport.send(&message) {
            Ok(_) => {
                self.last_error_suppressed.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if !self.last_error_suppressed.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "email sink delivery failed, suppressing further errors until recovery");
                }
                Err(SinkError::Remote(e.to_string()))
            }
        }
    }
}

/// Builds a sink instance from its raw config. `alert_log_max_bytes`
/// applies to `log` sinks only.
pub fn build_sink(config: &RawSinkConfig, alert_log_max_bytes: u64) -> Result<Arc<dyn NotificationSink>, SinkError> {
    match config.kind {
        super::rules::SinkKind::Log => {
            let path = config.config.get("path").cloned().unwrap_or_else(|| "./alerts.log".to_owned());
            Ok(Arc::new(LogSink::new(path, alert_log_max_bytes)?))
        }
        super::rules::SinkKind::Webhook => {
            let url = config.config.get("url").cloned().unwrap_or_default();
            let timeout_ms: u64 = config.config.get("timeout_ms").and_then(|s| s.parse().ok()).unwrap_or(10_000);
            Ok(Arc::new(WebhookSink::new(url, Duration::from_millis(timeout_ms))?))
        }
        super::rules::SinkKind::Email => {
            let from = config.config.get("from").cloned().unwrap_or_default();
            let to = config.config.get("to").cloned().unwrap_or_default();
            let smtp_host = config.config.get("smtp_host").cloned().unwrap_or_default();
            let credentials = match (config.config.get("smtp_user"), config.config.get("smtp_password")) {
                (Some(u), Some(p)) => Some(Credentials::new(u.clone(), p.clone())),
                _ => None,
            };
            Ok(Arc::new(EmailSink::new(from, to, smtp_host, credentials)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::rules::{Condition, Severity};
    use tempfile::tempdir;

    fn sample_event() -> AlertEvent {
        AlertEvent {
            rule_name: "high_cpu".into(),
            metric_type: "cpu.total_usage".into(),
            condition: Condition::Above,
            threshold: 50.0,
            severity: Severity::Warning,
            fired_at: 1_700_000_000,
            hostname: "host1".into(),
            observed_value: 75.0,
            message: "cpu above threshold".into(),
            pid: None,
        }
    }

    #[test]
    fn log_sink_writes_one_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.log");
        let sink = LogSink::new(&path, 10 * 1024 * 1024).unwrap();
        sink.send(&sample_event()).unwrap();
        sink.send(&sample_event()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn log_sink_rotates_past_max_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.log");
        let sink = LogSink::new(&path, 50).unwrap();
        for _ in 0..10 {
            sink.send(&sample_event()).unwrap();
        }
        assert!(dir.path().join("alerts.log.1").exists());
    }
}
