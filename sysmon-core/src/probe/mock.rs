//! Test doubles for platform probing: an in-memory `FileSystem` fixture and
//! a canned `Probe` implementation, so the Collector and alert pipeline can
//! be exercised deterministically without a real `/proc`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use super::fs::FileSystem;
use super::{CoreUsage, CpuSnapshot, DiskSnapshot, MemorySnapshot, NetworkSnapshot, Probe, ProcessEntry};
use crate::error::ProbeError;

/// In-memory `FileSystem`: file contents and directory listings are set up
/// ahead of time with [`FixtureFs::set`] / [`FixtureFs::set_dir`].
#[derive(Clone, Debug, Default)]
pub struct FixtureFs {
    files: HashMap<PathBuf, String>,
    dirs: HashMap<PathBuf, Vec<PathBuf>>,
}

impl FixtureFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn set_dir(&mut self, path: impl Into<PathBuf>, entries: Vec<PathBuf>) {
        self.dirs.insert(path.into(), entries);
    }
}

impl FileSystem for FixtureFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.dirs.contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}

/// A `Probe` that returns a fixed, caller-supplied snapshot for every
/// accessor. Used by Collector and AlertEngine tests that need
/// deterministic readings rather than real system state.
#[derive(Clone, Default)]
pub struct MockProbe {
    pub cpu: Option<CpuSnapshot>,
    pub memory: Option<MemorySnapshot>,
    pub disks: Vec<DiskSnapshot>,
    pub networks: Vec<NetworkSnapshot>,
    pub processes: Vec<ProcessEntry>,
    pub fail_with: Option<ProbeError>,
}

impl MockProbe {
    /// A small, internally-consistent system: one CPU, modest memory use,
    /// one disk, one interface, two processes — enough to exercise alert
    /// rule matching without fixture boilerplate at every call site.
    pub fn typical_system(timestamp: i64) -> Self {
        Self {
            cpu: Some(CpuSnapshot {
                timestamp,
                total_usage: 35.0,
                per_core: vec![CoreUsage { core_id: 0, usage_percent: 35.0 }],
                core_count: 1,
                load1: 0.5,
                load5: 0.4,
                load15: 0.3,
                context_switches: 1000,
                interrupts: 500,
            }),
            memory: Some(MemorySnapshot {
                timestamp,
                total_bytes: 16_000_000_000,
                used_bytes: 8_000_000_000,
                free_bytes: 8_000_000_000,
                available_bytes: 8_000_000_000,
                cached_bytes: 1_000_000_000,
                buffers_bytes: 200_000_000,
                swap_total_bytes: 2_000_000_000,
                swap_used_bytes: 0,
            }),
            disks: vec![DiskSnapshot {
                timestamp,
                device: "sda1".to_owned(),
                mount_path: "/".to_owned(),
                total_bytes: 500_000_000_000,
                used_bytes: 200_000_000_000,
                free_bytes: 300_000_000_000,
                read_bytes: 1_000_000,
                write_bytes: 500_000,
            }],
            networks: vec![NetworkSnapshot {
                timestamp,
                interface: "eth0".to_owned(),
                bytes_sent: 1_000_000,
                bytes_recv: 2_000_000,
                packets_sent: 1000,
                packets_recv: 2000,
                errors_in: 0,
                errors_out: 0,
                drops_in: 0,
                drops_out: 0,
            }],
            processes: vec![
                ProcessEntry {
                    timestamp,
                    pid: 100,
                    parent_pid: 1,
                    name: "sysmon-agent".to_owned(),
                    username: "sysmon".to_owned(),
                    resident_bytes: 50_000_000,
                    cpu_percent: 2.0,
                    thread_count: 4,
                    open_file_count: 12,
                    read_bytes: 10_000,
                    write_bytes: 5_000,
                },
                ProcessEntry {
                    timestamp,
                    pid: 200,
                    parent_pid: 1,
                    name: "example-app".to_owned(),
                    username: "app".to_owned(),
                    resident_bytes: 300_000_000,
                    cpu_percent: 15.0,
                    thread_count: 8,
                    open_file_count: 40,
                    read_bytes: 1_000_000,
                    write_bytes: 500_000,
                },
            ],
            fail_with: None,
        }
    }

    pub fn failing(err: ProbeError) -> Self {
        Self { fail_with: Some(err), ..Self::default() }
    }
}

impl Probe for MockProbe {
    fn cpu(&mut self) -> Result<CpuSnapshot, ProbeError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.cpu.clone().ok_or_else(|| ProbeError::NotSupported("no fixture cpu set".into()))
    }

    fn memory(&mut self) -> Result<MemorySnapshot, ProbeError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.memory.clone().ok_or_else(|| ProbeError::NotSupported("no fixture memory set".into()))
    }

    fn disks(&mut self) -> Result<Vec<DiskSnapshot>, ProbeError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(self.disks.clone())
    }

    fn networks(&mut self) -> Result<Vec<NetworkSnapshot>, ProbeError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(self.networks.clone())
    }

    fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(self.processes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_fs_reads_back_set_content() {
        let mut fs = FixtureFs::new();
        fs.set("/proc/stat", "cpu 1 2 3 4\n");
        assert_eq!(fs.read_to_string(Path::new("/proc/stat")).unwrap(), "cpu 1 2 3 4\n");
        assert!(fs.exists(Path::new("/proc/stat")));
        assert!(fs.read_to_string(Path::new("/proc/missing")).is_err());
    }

    #[test]
    fn mock_probe_typical_system_is_internally_consistent() {
        let mut probe = MockProbe::typical_system(1_700_000_000);
        let mem = probe.memory().unwrap();
        assert!((mem.usage_percent() - 50.0).abs() < 1e-9);
        assert_eq!(probe.processes().unwrap().len(), 2);
    }

    #[test]
    fn mock_probe_failing_reports_configured_error() {
        let mut probe = MockProbe::failing(ProbeError::Permission("denied".into()));
        assert!(probe.cpu().is_err());
    }
}
