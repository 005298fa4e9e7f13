//! `NetworkPublisher`: ships batched samples to a configured aggregator
//! over HTTP, retrying transient failures with full-jitter backoff before
//! giving up on a batch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ringqueue::RingQueue;
use crate::sample::MetricSample;

pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_MAX: usize = 100;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub aggregator_url: String,
    pub auth_token: String,
    pub hostname: String,
    pub host_tags: std::collections::HashMap<String, String>,
    pub push_interval: Duration,
    pub batch_max: usize,
    pub queue_capacity: usize,
    pub http_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            aggregator_url: String::new(),
            auth_token: String::new(),
            hostname: String::new(),
            host_tags: std::collections::HashMap::new(),
            push_interval: DEFAULT_PUSH_INTERVAL,
            batch_max: DEFAULT_BATCH_MAX,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

#[derive(Serialize)]
struct IngestEnvelope<'a> {
    hostname: &'a str,
    version: &'a str,
    platform: &'a str,
    tags: &'a std::collections::HashMap<String, String>,
    metrics: Vec<WireSample>,
}

#[derive(Serialize)]
struct WireSample {
    timestamp: i64,
    metric_type: String,
    value: f64,
    tags: String,
}

impl From<&MetricSample> for WireSample {
    fn from(s: &MetricSample) -> Self {
        WireSample { timestamp: s.timestamp, metric_type: s.metric_type.clone(), value: s.value, tags: s.tags_encoded() }
    }
}

/// `base * 2^attempt`, capped at 30s, with a uniform random jitter fraction
/// applied on top. Pure and deterministic given `jitter_fraction`, so the
/// backoff schedule itself is unit-testable without a clock.
pub fn backoff_delay(base: Duration, attempt: u32, jitter_fraction: f64) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = exp.min(MAX_BACKOFF.as_secs_f64());
    let jittered = capped * (1.0 + jitter_fraction);
    Duration::from_secs_f64(jittered.max(0.0))
}

fn random_jitter_fraction() -> f64 {
    rand::thread_rng().gen_range(0.0..0.5)
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub queue_overflow: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub samples_sent: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

pub struct PublisherStatsSnapshot {
    pub queue_depth: usize,
    pub queue_overflow: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub samples_sent: u64,
    pub samples_dropped: u64,
    pub last_error: Option<String>,
}

pub struct NetworkPublisher {
    queue: Arc<RingQueue<MetricSample>>,
    stats: Arc<PublisherStats>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkPublisher {
    pub fn start(config: PublisherConfig) -> Self {
        let queue: Arc<RingQueue<MetricSample>> = Arc::new(RingQueue::new(config.queue_capacity));
        let stats = Arc::new(PublisherStats::default());
        let running = Arc::new(AtomicBool::new(true));

        let client = reqwest::blocking::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .expect("http client config is always valid");

        let worker = {
            let queue = queue.clone();
            let stats = stats.clone();
            let running = running.clone();
            std::thread::spawn(move || worker_loop(config, client, queue, stats, running))
        };

        Self { queue, stats, running, worker: Some(worker) }
    }

    /// Enqueues a sample; never blocks. Drops the oldest queued sample on
    /// overflow so recent data is preserved (backpressure
    /// policy for the Collector→Publisher boundary).
    pub fn enqueue(&self, sample: MetricSample) {
        if self.queue.push_evicting_oldest(sample) {
            self.stats.queue_overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            queue_depth: self.queue.len(),
            queue_overflow: self.stats.queue_overflow.load(Ordering::Relaxed),
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.stats.batches_dropped.load(Ordering::Relaxed),
            samples_sent: self.stats.samples_sent.load(Ordering::Relaxed),
            samples_dropped: self.stats.samples_dropped.load(Ordering::Relaxed),
            last_error: self.stats.last_error.lock().unwrap().clone(),
        }
    }

    /// Stops the worker, waiting up to `grace_period` for in-flight queued
    /// samples to drain.
    pub fn shutdown(&mut self, grace_period: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + grace_period;
        while !self.queue.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NetworkPublisher {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}

fn worker_loop(
    config: PublisherConfig,
    client: reqwest::blocking::Client,
    queue: Arc<RingQueue<MetricSample>>,
    stats: Arc<PublisherStats>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(config.push_interval);
        let batch = queue.pop_batch(config.batch_max);
        if batch.is_empty() {
            continue;
        }
        send_with_retry(&config, &client, &stats, batch);
    }

    // Final drain on shutdown: best-effort, no retry budget beyond what's configured.
    let remaining = queue.pop_batch(usize::MAX);
    if !remaining.is_empty() {
        send_with_retry(&config, &client, &stats, remaining);
    }
}

/// Retries a batch in place (the worker thread is otherwise idle during
/// backoff, so holding the batch is equivalent to reinserting it at the
/// queue head and immediately popping it back) until it sends or
/// `retry_max_attempts` is exhausted.
fn send_with_retry(
    config: &PublisherConfig,
    client: &reqwest::blocking::Client,
    stats: &Arc<PublisherStats>,
    batch: Vec<MetricSample>,
) {
    let batch_len = batch.len();
    let mut attempt = 0;

    loop {
        match send_batch(config, client, &batch) {
            Ok(()) => {
                stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                stats.samples_sent.fetch_add(batch_len as u64, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                *stats.last_error.lock().unwrap() = Some(e.clone());
                attempt += 1;
                if attempt >= config.retry_max_attempts {
                    warn!(error = %e, attempts = attempt, "publisher batch exhausted retries, dropping");
                    stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    stats.samples_dropped.fetch_add(batch_len as u64, Ordering::Relaxed);
                    return;
                }
                let delay = backoff_delay(config.retry_base_delay, attempt - 1, random_jitter_fraction());
                debug!(error = %e, attempt, delay_ms = delay.as_millis(), "publisher batch failed, retrying");
                std::thread::sleep(delay);
            }
        }
    }
}

fn send_batch(config: &PublisherConfig, client: &reqwest::blocking::Client, batch: &[MetricSample]) -> Result<(), String> {
    let envelope = IngestEnvelope {
        hostname: &config.hostname,
        version: env!("CARGO_PKG_VERSION"),
        platform: std::env::consts::OS,
        tags: &config.host_tags,
        metrics: batch.iter().map(WireSample::from).collect(),
    };

    let url = format!("{}/api/metrics", config.aggregator_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .header("X-SysMon-Token", &config.auth_token)
        .json(&envelope)
        .send()
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("aggregator returned {}", response.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let d0 = backoff_delay(Duration::from_millis(100), 0, 0.0);
        let d1 = backoff_delay(Duration::from_millis(100), 1, 0.0);
        let d2 = backoff_delay(Duration::from_millis(100), 2, 0.0);
        assert_eq!(d0, Duration::from_millis(100));
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(400));

        let big = backoff_delay(Duration::from_secs(10), 10, 0.0);
        assert_eq!(big, MAX_BACKOFF);
    }

    #[test]
    fn backoff_jitter_only_increases_delay() {
        let base = backoff_delay(Duration::from_millis(100), 0, 0.0);
        let jittered = backoff_delay(Duration::from_millis(100), 0, 0.3);
        assert!(jittered > base);
    }

    #[test]
    fn enqueue_reports_overflow_via_stats() {
        let publisher = NetworkPublisherTestHandle::new(2);
        publisher.publisher.enqueue(MetricSample::new(1, "m", "h", 1.0));
        publisher.publisher.enqueue(MetricSample::new(2, "m", "h", 2.0));
        publisher.publisher.enqueue(MetricSample::new(3, "m", "h", 3.0));
        let stats = publisher.publisher.stats();
        assert_eq!(stats.queue_overflow, 1);
        assert_eq!(stats.queue_depth, 2);
    }

    /// Wraps a `NetworkPublisher` whose worker thread never sends (the
    /// aggregator URL is unroutable), isolating `enqueue`/`stats` behavior
    /// from network I/O in unit tests.
    struct NetworkPublisherTestHandle {
        publisher: NetworkPublisher,
    }

    impl NetworkPublisherTestHandle {
        fn new(queue_capacity: usize) -> Self {
            let config = PublisherConfig {
                aggregator_url: "http://127.0.0.1:1".to_owned(),
                auth_token: "t".to_owned(),
                hostname: "h".to_owned(),
                queue_capacity,
                push_interval: Duration::from_secs(3600),
                ..Default::default()
            };
            Self { publisher: NetworkPublisher::start(config) }
        }
    }
}
