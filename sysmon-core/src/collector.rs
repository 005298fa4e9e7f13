//! The Collector scheduler: ticks a `Probe` on a fixed interval, turns
//! snapshots into `MetricSample`s, and fans them out to the store, the
//! alert engine, and (if configured) the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::alert::AlertEngine;
use crate::probe::{CpuSnapshot, DiskSnapshot, MemorySnapshot, NetworkSnapshot, ProcessEntry, Probe};
use crate::publisher::NetworkPublisher;
use crate::sample::MetricSample;
use crate::storage::TimeSeriesStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PROCESS_TICK_DIVISOR: u64 = 5;

/// Per-tick instrumentation:
/// exposed for operational tooling even though no query surface for it is
/// specified yet.
#[derive(Debug, Clone, Default)]
pub struct CollectorTiming {
    pub total: Duration,
    pub cpu: Duration,
    pub memory: Duration,
    pub disks: Duration,
    pub networks: Duration,
    pub processes: Duration,
}

pub struct CollectorConfig {
    pub interval: Duration,
    pub process_tick_divisor: u64,
    pub hostname: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { interval: DEFAULT_INTERVAL, process_tick_divisor: DEFAULT_PROCESS_TICK_DIVISOR, hostname: String::new() }
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Drives a `Probe` on a fixed cadence from a dedicated thread. The tick
/// loop never blocks on the store's commit or the publisher's send: both
/// `TimeSeriesStore::append`/`append_many` and `NetworkPublisher::enqueue`
/// return immediately after enqueueing.
pub struct Collector {
    config: CollectorConfig,
    probe: Box<dyn Probe>,
    store: Arc<TimeSeriesStore>,
    alert_engine: Arc<AlertEngine>,
    publisher: Option<Arc<NetworkPublisher>>,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
    last_timing: Arc<Mutex<Option<CollectorTiming>>>,
}

impl Collector {
    pub fn new(
        mut config: CollectorConfig,
        probe: Box<dyn Probe>,
        store: Arc<TimeSeriesStore>,
        alert_engine: Arc<AlertEngine>,
        publisher: Option<Arc<NetworkPublisher>>,
    ) -> Self {
        config.interval = clamp_interval(config.interval);
        Self {
            config,
            probe,
            store,
            alert_engine,
            publisher,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            last_timing: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_timing(&self) -> Option<CollectorTiming> {
        self.last_timing.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one tick synchronously: samples every family whose turn it is,
    /// writes to the store, feeds the alert engine, and forwards to the
    /// publisher. Exposed standalone so tests (and `run_once` binaries
    /// like `sysmonctl`) can drive a single tick deterministically.
    pub fn tick(&mut self, tick_index: u64, now_unix: i64) -> CollectorTiming {
        let tick_start = Instant::now();
        let mut timing = CollectorTiming::default();
        let mut samples = Vec::new();

        let t0 = Instant::now();
        match self.probe.cpu() {
            Ok(cpu) => samples.extend(cpu_samples(&cpu, &self.config.hostname)),
            Err(e) => warn!(error = %e, "cpu probe failed"),
        }
        timing.cpu = t0.elapsed();

        let t0 = Instant::now();
        match self.probe.memory() {
            Ok(mem) => samples.extend(memory_samples(&mem, &self.config.hostname)),
            Err(e) => warn!(error = %e, "memory probe failed"),
        }
        timing.memory = t0.elapsed();

        let t0 = Instant::now();
        match self.probe.disks() {
            Ok(disks) => {
                for disk in &disks {
                    samples.extend(disk_samples(disk, &self.config.hostname));
                }
            }
            Err(e) => warn!(error = %e, "disk probe failed"),
        }
        timing.disks = t0.elapsed();

        let t0 = Instant::now();
        match self.probe.networks() {
            Ok(networks) => {
                for network in &networks {
                    samples.extend(network_samples(network, &self.config.hostname));
                }
            }
            Err(e) => warn!(error = %e, "network probe failed"),
        }
        timing.networks = t0.elapsed();

        if tick_index % self.config.process_tick_divisor == 0 {
            let t0 = Instant::now();
            match self.probe.processes() {
                Ok(processes) => {
                    for process in &processes {
                        samples.extend(process_samples(process, &self.config.hostname));
                    }
                }
                Err(e) => warn!(error = %e, "process probe failed"),
            }
            timing.processes = t0.elapsed();
        }

        for sample in &samples {
            self.alert_engine.ingest(sample, Instant::now(), now_unix);
        }

        if let Err(e) = self.store.append_many(samples.clone()) {
            warn!(error = %e, "store append_many failed, samples dropped this tick");
        }

        if let Some(publisher) = &self.publisher {
            for sample in samples {
                publisher.enqueue(sample);
            }
        }

        timing.total = tick_start.elapsed();
        if timing.total > self.config.interval {
            debug!(tick = tick_index, overrun_ms = (timing.total - self.config.interval).as_millis(), "tick overrun");
        }
        *self.last_timing.lock().unwrap() = Some(timing.clone());
        timing
    }

    /// Starts the tick loop on a dedicated thread. Idempotent: calling
    /// `start` while already running is a no-op.
    pub fn start(mut self) -> RunningCollector {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let running_for_handle = self.running.clone();
        let interval = self.config.interval;

        let handle = std::thread::spawn(move || {
            let mut tick_index: u64 = 0;
            while running.load(Ordering::SeqCst) {
                let tick_start = Instant::now();
                let now_unix = chrono::Utc::now().timestamp();
                self.tick(tick_index, now_unix);
                tick_index += 1;

                let elapsed = tick_start.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        });

        RunningCollector { running: running_for_handle, handle: Some(handle) }
    }
}

/// Handle to a started `Collector`. Dropping it requests shutdown but does
/// not block; call `stop` to wait for the tick thread to exit.
pub struct RunningCollector {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RunningCollector {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RunningCollector {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn cpu_samples(cpu: &CpuSnapshot, host: &str) -> Vec<MetricSample> {
    let mut samples = vec![
        MetricSample::new(cpu.timestamp, "cpu.total_usage", host, cpu.total_usage),
        MetricSample::new(cpu.timestamp, "cpu.load1", host, cpu.load1),
        MetricSample::new(cpu.timestamp, "cpu.load5", host, cpu.load5),
        MetricSample::new(cpu.timestamp, "cpu.load15", host, cpu.load15),
        MetricSample::new(cpu.timestamp, "cpu.context_switches", host, cpu.context_switches as f64),
        MetricSample::new(cpu.timestamp, "cpu.interrupts", host, cpu.interrupts as f64),
        MetricSample::new(cpu.timestamp, "cpu.core_count", host, cpu.core_count as f64),
    ];
    for core in &cpu.per_core {
        samples.push(MetricSample::new(cpu.timestamp, "cpu.core_usage", host, core.usage_percent).with_tag("core", core.core_id.to_string()));
    }
    samples
}

fn memory_samples(mem: &MemorySnapshot, host: &str) -> Vec<MetricSample> {
    vec![
        MetricSample::new(mem.timestamp, "memory.usage_percent", host, mem.usage_percent()),
        MetricSample::new(mem.timestamp, "memory.total_bytes", host, mem.total_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.used_bytes", host, mem.used_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.free_bytes", host, mem.free_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.available_bytes", host, mem.available_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.cached_bytes", host, mem.cached_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.buffers_bytes", host, mem.buffers_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.swap_total_bytes", host, mem.swap_total_bytes as f64),
        MetricSample::new(mem.timestamp, "memory.swap_used_bytes", host, mem.swap_used_bytes as f64),
    ]
}

fn disk_samples(disk: &DiskSnapshot, host: &str) -> Vec<MetricSample> {
    vec![
        MetricSample::new(disk.timestamp, "disk.usage_percent", host, disk.usage_percent()).with_tag("device", &disk.device),
        MetricSample::new(disk.timestamp, "disk.total_bytes", host, disk.total_bytes as f64).with_tag("device", &disk.device),
        MetricSample::new(disk.timestamp, "disk.used_bytes", host, disk.used_bytes as f64).with_tag("device", &disk.device),
        MetricSample::new(disk.timestamp, "disk.free_bytes", host, disk.free_bytes as f64).with_tag("device", &disk.device),
        MetricSample::new(disk.timestamp, "disk.read_bytes", host, disk.read_bytes as f64).with_tag("device", &disk.device),
        MetricSample::new(disk.timestamp, "disk.write_bytes", host, disk.write_bytes as f64).with_tag("device", &disk.device),
    ]
}

fn network_samples(network: &NetworkSnapshot, host: &str) -> Vec<MetricSample> {
    vec![
        MetricSample::new(network.timestamp, "network.bytes_sent", host, network.bytes_sent as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.bytes_recv", host, network.bytes_recv as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.packets_sent", host, network.packets_sent as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.packets_recv", host, network.packets_recv as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.errors_in", host, network.errors_in as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.errors_out", host, network.errors_out as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.drops_in", host, network.drops_in as f64).with_tag("interface", &network.interface),
        MetricSample::new(network.timestamp, "network.drops_out", host, network.drops_out as f64).with_tag("interface", &network.interface),
    ]
}

fn process_samples(process: &ProcessEntry, host: &str) -> Vec<MetricSample> {
    let tag = |s: MetricSample| s.with_tag("pid", process.pid.to_string()).with_tag("process_name", &process.name);
    vec![
        tag(MetricSample::new(process.timestamp, "process.cpu_percent", host, process.cpu_percent)),
        tag(MetricSample::new(process.timestamp, "process.resident_bytes", host, process.resident_bytes as f64)),
        tag(MetricSample::new(process.timestamp, "process.parent_pid", host, process.parent_pid as f64)),
        tag(MetricSample::new(process.timestamp, "process.thread_count", host, process.thread_count as f64)),
        tag(MetricSample::new(process.timestamp, "process.open_file_count", host, process.open_file_count as f64)),
        tag(MetricSample::new(process.timestamp, "process.read_bytes", host, process.read_bytes as f64)),
        tag(MetricSample::new(process.timestamp, "process.write_bytes", host, process.write_bytes as f64)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::storage::StoreConfig;
    use tempfile::tempdir;

    fn build_collector(dir: &std::path::Path) -> Collector {
        let store = Arc::new(TimeSeriesStore::open(StoreConfig::new(dir.join("test.db"))).unwrap());
        let alert_engine = Arc::new(AlertEngine::new("test-host"));
        let config = CollectorConfig { interval: Duration::from_millis(100), process_tick_divisor: 1, hostname: "test-host".into() };
        Collector::new(config, Box::new(MockProbe::typical_system(0)), store, alert_engine, None)
    }

    #[test]
    fn tick_appends_samples_to_store_and_respects_process_divisor() {
        let dir = tempdir().unwrap();
        let mut collector = build_collector(dir.path());
        collector.tick(0, 0);
        collector.store.flush(Duration::from_secs(2)).unwrap();
        let types = collector.store.metric_types().unwrap();
        assert!(types.contains(&"cpu.total_usage".to_string()));
        assert!(types.contains(&"process.cpu_percent".to_string()));
    }

    #[test]
    fn tick_records_timing_for_each_family() {
        let dir = tempdir().unwrap();
        let mut collector = build_collector(dir.path());
        let timing = collector.tick(0, 0);
        assert!(timing.total >= timing.cpu);
        assert_eq!(collector.last_timing().unwrap().total, timing.total);
    }
}
