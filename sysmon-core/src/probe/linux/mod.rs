//! Linux backend for `Probe`, reading `/proc` directly.
//!
//! No `procfs` crate: the files this probe reads (`/proc/stat`,
//! `/proc/meminfo`, `/proc/diskstats`, `/proc/net/dev`, `/proc/[pid]/*`) have
//! a stable enough format that hand-rolled line parsing is simpler than
//! pulling in a wrapper crate for a handful of fields.

mod parse;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::fs::{FileSystem, RealFs};
use super::{CoreUsage, CpuSnapshot, DiskSnapshot, MemorySnapshot, NetworkSnapshot, Probe, ProcessEntry};
use crate::error::ProbeError;

/// Pseudo-filesystems we don't report disk usage for; real backing devices
/// only.
const VIRTUAL_FS_TYPES: &[&str] = &[
    "proc", "sysfs", "devtmpfs", "devpts", "tmpfs", "cgroup", "cgroup2", "overlay", "squashfs",
    "autofs", "mqueue", "debugfs", "tracefs", "securityfs", "pstore", "bpf", "binfmt_misc",
    "configfs", "fusectl", "nsfs",
];

struct CpuDeltaState {
    aggregate: parse::RawCpuLine,
    per_core: HashMap<u32, parse::RawCpuLine>,
}

struct ProcessDeltaState {
    cpu_ticks: u64,
    sampled_at: Instant,
}

pub struct LinuxProbe {
    proc_path: PathBuf,
    fs: Box<dyn FileSystem>,
    clk_tck: i64,
    prev_cpu: Option<CpuDeltaState>,
    prev_processes: HashMap<u32, ProcessDeltaState>,
    uid_cache: HashMap<u32, String>,
}

impl LinuxProbe {
    pub fn new(proc_path: impl Into<PathBuf>) -> Self {
        Self::with_fs(proc_path, RealFs::new())
    }

    pub fn with_fs(proc_path: impl Into<PathBuf>, fs: impl FileSystem + 'static) -> Self {
        Self {
            proc_path: proc_path.into(),
            fs: Box::new(fs),
            clk_tck: sysconf_clk_tck(),
            prev_cpu: None,
            prev_processes: HashMap::new(),
            uid_cache: HashMap::new(),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.proc_path.join(rel)
    }

    fn read(&self, rel: &str) -> Result<String, ProbeError> {
        self.fs.read_to_string(&self.path(rel)).map_err(ProbeError::from)
    }

    fn username_for_uid(&mut self, uid: u32) -> String {
        if let Some(name) = self.uid_cache.get(&uid) {
            return name.clone();
        }
        let name = self
            .fs
            .read_to_string(Path::new("/etc/passwd"))
            .ok()
            .and_then(|content| parse::resolve_username_from_passwd(&content, uid))
            .unwrap_or_else(|| uid.to_string());
        self.uid_cache.insert(uid, name.clone());
        name
    }

    fn list_pids(&self) -> Vec<u32> {
        let entries = match self.fs.read_dir(&self.proc_path) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .into_iter()
            .filter_map(|p| p.file_name()?.to_str()?.parse::<u32>().ok())
            .collect()
    }
}

fn delta_usage_percent(prev: &parse::RawCpuLine, curr: &parse::RawCpuLine) -> f64 {
    let total_delta = curr.total().saturating_sub(prev.total());
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = curr.idle_total().saturating_sub(prev.idle_total());
    (total_delta.saturating_sub(idle_delta)) as f64 / total_delta as f64 * 100.0
}

impl Probe for LinuxProbe {
    fn cpu(&mut self) -> Result<CpuSnapshot, ProbeError> {
        let stat = parse::parse_stat(&self.read("stat")?);
        let loadavg = parse::parse_loadavg(&self.read("loadavg")?);
        let aggregate = stat
            .cpus
            .iter()
            .find(|c| c.cpu_id.is_none())
            .cloned()
            .unwrap_or_default();
        let per_core_raw: HashMap<u32, parse::RawCpuLine> = stat
            .cpus
            .iter()
            .filter_map(|c| c.cpu_id.map(|id| (id, c.clone())))
            .collect();

        // First call seeds delta state and reports zero utilization.
        let (total_usage, per_core) = match &self.prev_cpu {
            None => {
                let per_core = per_core_raw
                    .keys()
                    .map(|&core_id| CoreUsage { core_id, usage_percent: 0.0 })
                    .collect();
                (0.0, per_core)
            }
            Some(prev) => {
                let total_usage = delta_usage_percent(&prev.aggregate, &aggregate);
                let mut per_core: Vec<CoreUsage> = per_core_raw
                    .iter()
                    .map(|(&core_id, curr)| {
                        let usage_percent = match prev.per_core.get(&core_id) {
                            Some(prev_core) => delta_usage_percent(prev_core, curr),
                            None => 0.0,
                        };
                        CoreUsage { core_id, usage_percent }
                    })
                    .collect();
                per_core.sort_by_key(|c| c.core_id);
                (total_usage, per_core)
            }
        };

        self.prev_cpu = Some(CpuDeltaState {
            aggregate: aggregate.clone(),
            per_core: per_core_raw.clone(),
        });

        Ok(CpuSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            total_usage,
            core_count: per_core_raw.len() as u32,
            per_core,
            load1: loadavg.load1,
            load5: loadavg.load5,
            load15: loadavg.load15,
            context_switches: stat.ctxt,
            interrupts: stat.interrupts_total,
        })
    }

    fn memory(&mut self) -> Result<MemorySnapshot, ProbeError> {
        let info = parse::parse_meminfo(&self.read("meminfo")?);
        let total = info.mem_total_kb * 1024;
        let free = info.mem_free_kb * 1024;
        let available = info.mem_available_kb * 1024;
        let cached = info.cached_kb * 1024;
        let buffers = info.buffers_kb * 1024;
        // `used = total - free - buffers - cached`, never `total -
        // available`: `usage_percent` is always `used / total`, never mixed
        // with the availability-based formula.
        let used = total.saturating_sub(free).saturating_sub(buffers).saturating_sub(cached);
        Ok(MemorySnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            total_bytes: total,
            used_bytes: used,
            free_bytes: free,
            available_bytes: available,
            cached_bytes: cached,
            buffers_bytes: buffers,
            swap_total_bytes: info.swap_total_kb * 1024,
            swap_used_bytes: info.swap_total_kb.saturating_sub(info.swap_free_kb) * 1024,
        })
    }

    fn disks(&mut self) -> Result<Vec<DiskSnapshot>, ProbeError> {
        let diskstats = parse::parse_diskstats(&self.read("diskstats")?);
        let by_device: HashMap<&str, &parse::RawDiskLine> =
            diskstats.iter().map(|d| (d.device.as_str(), d)).collect();
        let mounts = parse::parse_mounts(&self.read("mounts")?);

        let timestamp = chrono::Utc::now().timestamp();
        let mut out = Vec::new();
        for mount in mounts {
            if VIRTUAL_FS_TYPES.contains(&mount.fs_type.as_str()) {
                continue;
            }
            let Some(basename) = mount.device.strip_prefix("/dev/") else {
                continue;
            };
            let (total_bytes, free_bytes) = match statvfs_bytes(&mount.mount_path) {
                Some(pair) => pair,
                None => continue,
            };
            let io = by_device.get(basename);
            out.push(DiskSnapshot {
                timestamp,
                device: basename.to_owned(),
                mount_path: mount.mount_path,
                total_bytes,
                used_bytes: total_bytes.saturating_sub(free_bytes),
                free_bytes,
                read_bytes: io.map(|d| d.sectors_read * 512).unwrap_or(0),
                write_bytes: io.map(|d| d.sectors_written * 512).unwrap_or(0),
            });
        }
        Ok(out)
    }

    fn networks(&mut self) -> Result<Vec<NetworkSnapshot>, ProbeError> {
        let lines = parse::parse_net_dev(&self.read("net/dev")?);
        let timestamp = chrono::Utc::now().timestamp();
        Ok(lines
            .into_iter()
            .map(|l| NetworkSnapshot {
                timestamp,
                interface: l.interface,
                bytes_sent: l.tx_bytes,
                bytes_recv: l.rx_bytes,
                packets_sent: l.tx_packets,
                packets_recv: l.rx_packets,
                errors_in: l.rx_errs,
                errors_out: l.tx_errs,
                drops_in: l.rx_drop,
                drops_out: l.tx_drop,
            })
            .collect())
    }

    fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError> {
        let timestamp = chrono::Utc::now().timestamp();
        let now = Instant::now();
        let mut out = Vec::new();
        let mut seen = HashMap::new();

        for pid in self.list_pids() {
            let stat_path = format!("{pid}/stat");
            let Ok(stat_raw) = self.read(&stat_path) else {
                continue;
            };
            let Some(stat) = parse::parse_process_stat(&stat_raw) else {
                continue;
            };

            let rss_kb = self
                .read(&format!("{pid}/status"))
                .map(|s| parse::parse_status_rss_kb(&s))
                .unwrap_or(0);
            let uid = self
                .read(&format!("{pid}/status"))
                .ok()
                .and_then(|s| parse::parse_status_uid(&s));
            let io = self
                .read(&format!("{pid}/io"))
                .map(|s| parse::parse_process_io(&s))
                .unwrap_or_default();
            let open_fds = self
                .fs
                .read_dir(&self.path(&format!("{pid}/fd")))
                .map(|v| v.len() as u32)
                .unwrap_or(0);

            let cpu_ticks = stat.utime + stat.stime;
            let cpu_percent = match self.prev_processes.get(&pid) {
                Some(prev) => {
                    let elapsed = now.duration_since(prev.sampled_at).as_secs_f64();
                    if elapsed <= 0.0 || self.clk_tck <= 0 {
                        0.0
                    } else {
                        let tick_delta = cpu_ticks.saturating_sub(prev.cpu_ticks) as f64;
                        tick_delta / self.clk_tck as f64 / elapsed * 100.0
                    }
                }
                None => 0.0,
            };
            seen.insert(pid, ProcessDeltaState { cpu_ticks, sampled_at: now });

            let username = match uid {
                Some(uid) => self.username_for_uid(uid),
                None => "unknown".to_owned(),
            };

            out.push(ProcessEntry {
                timestamp,
                pid,
                parent_pid: stat.ppid,
                name: stat.comm,
                username,
                resident_bytes: rss_kb * 1024,
                cpu_percent,
                thread_count: stat.num_threads,
                open_file_count: open_fds,
                read_bytes: io.read_bytes,
                write_bytes: io.write_bytes,
            });
        }

        self.prev_processes = seen;
        Ok(out)
    }
}

#[cfg(target_os = "linux")]
fn sysconf_clk_tck() -> i64 {
    // SAFETY: `sysconf` with `_SC_CLK_TCK` is a pure query with no
    // preconditions beyond being called on Linux/glibc, which this
    // module is gated on.
    unsafe { libc::sysconf(libc::_SC_CLK_TCK) }
}

#[cfg(not(target_os = "linux"))]
fn sysconf_clk_tck() -> i64 {
    100
}

#[cfg(target_os = "linux")]
fn statvfs_bytes(mount_path: &str) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let cpath = CString::new(mount_path).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `cpath` is a valid NUL-terminated C string and `stat` is
    // fully initialized by a successful call before we read any field.
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    let block_size = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block_size;
    let free = stat.f_bavail as u64 * block_size;
    Some((total, free))
}

#[cfg(not(target_os = "linux"))]
fn statvfs_bytes(_mount_path: &str) -> Option<(u64, u64)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::FixtureFs;

    fn fixture_fs() -> FixtureFs {
        let mut fs = FixtureFs::new();
        fs.set(
            "/proc/stat",
            "cpu  100 0 50 850 0 0 0 0 0 0\ncpu0 100 0 50 850 0 0 0 0 0 0\nctxt 10\nintr 20 0\n",
        );
        fs.set("/proc/loadavg", "0.10 0.20 0.15 1/200 999\n");
        fs.set(
            "/proc/meminfo",
            "MemTotal:  1000 kB\nMemFree:   400 kB\nMemAvailable: 600 kB\nBuffers: 10 kB\nCached: 20 kB\nSwapTotal: 100 kB\nSwapFree: 50 kB\n",
        );
        fs.set("/proc/diskstats", "8 0 sda 0 0 1000 0 0 0 2000 0 0 0 0\n");
        fs.set("/proc/mounts", "/dev/sda / ext4 rw 0 0\n");
        fs.set("/proc/net/dev", "Inter-|\n face |x\n  eth0: 10 1 0 0 0 0 0 0 20 2 0 0 0 0 0 0\n");
        fs
    }

    #[test]
    fn first_cpu_call_seeds_zero_usage() {
        let mut probe = LinuxProbe::with_fs("/proc", fixture_fs());
        let snapshot = probe.cpu().unwrap();
        assert_eq!(snapshot.total_usage, 0.0);
        assert!(snapshot.per_core.iter().all(|c| c.usage_percent == 0.0));
    }

    #[test]
    fn second_cpu_call_reports_nonzero_delta() {
        let mut fs = fixture_fs();
        let mut probe = LinuxProbe::with_fs("/proc", fs.clone());
        probe.cpu().unwrap();
        fs.set(
            "/proc/stat",
            "cpu  200 0 100 900 0 0 0 0 0 0\ncpu0 200 0 100 900 0 0 0 0 0 0\nctxt 20\nintr 30 0\n",
        );
        probe.fs = Box::new(fs);
        let snapshot = probe.cpu().unwrap();
        assert!(snapshot.total_usage > 0.0);
    }

    #[test]
    fn memory_computes_used_as_total_minus_free_buffers_cached() {
        let mut probe = LinuxProbe::with_fs("/proc", fixture_fs());
        let snapshot = probe.memory().unwrap();
        assert_eq!(snapshot.total_bytes, 1_000 * 1024);
        assert_eq!(snapshot.available_bytes, 600 * 1024);
        // total(1000) - free(400) - buffers(10) - cached(20) = 570 kB
        assert_eq!(snapshot.used_bytes, 570 * 1024);
        assert!((snapshot.usage_percent() - 57.0).abs() < 1e-9);
    }

    #[test]
    fn networks_parses_interface_counters() {
        let mut probe = LinuxProbe::with_fs("/proc", fixture_fs());
        let snapshots = probe.networks().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].interface, "eth0");
        assert_eq!(snapshots[0].bytes_recv, 10);
        assert_eq!(snapshots[0].bytes_sent, 20);
    }
}
