//! PlatformProbe: one abstract capability set — read one snapshot of each
//! metric family — implemented per OS behind a single closed trait.
//!
//! Consumers (the Collector) hold a `Box<dyn Probe>` and never know which
//! platform backend they are talking to. Adding a new platform is a module
//! addition under `probe::{linux, darwin, windows, stub}`, not a change to
//! the caller.

pub mod fs;
pub mod linux;
pub mod mock;
pub mod stub;

use crate::error::ProbeError;
use serde::{Deserialize, Serialize};

/// Per-core CPU utilization, `[0, 100]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoreUsage {
    pub core_id: u32,
    pub usage_percent: f64,
}

/// One CPU family snapshot.
///
/// `total_usage` and every `CoreUsage::usage_percent` are computed from the
/// delta between two cumulative-time samples; the first call after probe
/// construction seeds internal state and reports zero utilization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub timestamp: i64,
    pub total_usage: f64,
    pub per_core: Vec<CoreUsage>,
    pub core_count: u32,
    /// 1/5/15-minute load averages; `0.0` on platforms without the concept.
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    /// Cumulative counter since boot.
    pub context_switches: u64,
    /// Cumulative counter since boot.
    pub interrupts: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct MemorySnapshot {
    pub timestamp: i64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub cached_bytes: u64,
    pub buffers_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

impl MemorySnapshot {
    /// `used / total * 100`, never `(total - available) / total` — the two
    /// must never be mixed within one computation.
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub timestamp: i64,
    pub device: String,
    pub mount_path: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    /// Cumulative counter since boot.
    pub read_bytes: u64,
    /// Cumulative counter since boot.
    pub write_bytes: u64,
}

impl DiskSnapshot {
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub timestamp: i64,
    pub interface: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub timestamp: i64,
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub username: String,
    pub resident_bytes: u64,
    /// CPU-time delta since the previous snapshot, expressed as a percent
    /// (can exceed 100 on multi-core machines).
    pub cpu_percent: f64,
    pub thread_count: u32,
    pub open_file_count: u32,
    /// Cumulative counter since process start.
    pub read_bytes: u64,
    /// Cumulative counter since process start.
    pub write_bytes: u64,
}

/// One abstract capability set: read one snapshot of each metric family.
///
/// `&mut self` because CPU and process accessors keep small caches of
/// previous cumulative counters to compute deltas; it owns no other
/// persistent state.
pub trait Probe: Send {
    fn cpu(&mut self) -> Result<CpuSnapshot, ProbeError>;
    fn memory(&mut self) -> Result<MemorySnapshot, ProbeError>;
    fn disks(&mut self) -> Result<Vec<DiskSnapshot>, ProbeError>;
    fn networks(&mut self) -> Result<Vec<NetworkSnapshot>, ProbeError>;
    fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError>;
}

/// Builds the appropriate `Probe` for the current platform. On platforms
/// without a full backend, every accessor returns `ProbeError::NotSupported`
/// (platforms without a process table exposed via kernel API still
/// compile and run, just with nothing to report, rather than refusing to
/// build).
pub fn default_probe() -> Box<dyn Probe> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxProbe::new("/proc"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(stub::StubProbe::new())
    }
}
