//! Line-oriented parsers for the `/proc` files this probe reads.
//!
//! Parsing is done by hand (split on whitespace/colons, parse numeric
//! columns) rather than through a `procfs`-style crate, matching how the
//! these parsers work: `/proc`'s
//! format is stable enough, and one-file-one-parser keeps failure modes
//! local and easy to test with fixture strings.

/// One line of `/proc/stat`'s `cpu*` rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawCpuLine {
    /// `None` for the aggregate `cpu` line, `Some(n)` for `cpuN`.
    pub cpu_id: Option<u32>,
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl RawCpuLine {
    /// Sum of all time fields — the denominator for utilization math.
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedStat {
    pub cpus: Vec<RawCpuLine>,
    pub ctxt: u64,
    pub interrupts_total: u64,
}

/// Parses `/proc/stat`: the `cpu`/`cpuN` lines, plus `ctxt` and `intr`.
pub fn parse_stat(content: &str) -> ParsedStat {
    let mut out = ParsedStat::default();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("cpu") {
            let mut parts = rest.split_whitespace();
            let first = parts.next();
            let cpu_id = first.and_then(|s| if s.is_empty() { None } else { s.parse().ok() });
            let is_total = line.starts_with("cpu ");
            let fields: Vec<u64> = rest
                .split_whitespace()
                .skip(if is_total { 0 } else { 1 })
                .filter_map(|s| s.parse().ok())
                .collect();
            if fields.len() < 7 {
                continue;
            }
            out.cpus.push(RawCpuLine {
                cpu_id: if is_total { None } else { cpu_id },
                user: fields[0],
                nice: fields[1],
                system: fields[2],
                idle: fields[3],
                iowait: fields[4],
                irq: fields[5],
                softirq: fields[6],
                steal: fields.get(7).copied().unwrap_or(0),
            });
        } else if let Some(rest) = line.strip_prefix("ctxt ") {
            out.ctxt = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("intr ") {
            out.interrupts_total = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
        }
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedMeminfo {
    pub mem_total_kb: u64,
    pub mem_free_kb: u64,
    pub mem_available_kb: u64,
    pub buffers_kb: u64,
    pub cached_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

/// Parses `/proc/meminfo`. All values there are in kB.
pub fn parse_meminfo(content: &str) -> ParsedMeminfo {
    let mut out = ParsedMeminfo::default();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let value: u64 = rest
            .trim()
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        match key {
            "MemTotal" => out.mem_total_kb = value,
            "MemFree" => out.mem_free_kb = value,
            "MemAvailable" => out.mem_available_kb = value,
            "Buffers" => out.buffers_kb = value,
            "Cached" => out.cached_kb = value,
            "SwapTotal" => out.swap_total_kb = value,
            "SwapFree" => out.swap_free_kb = value,
            _ => {}
        }
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedLoadavg {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Parses `/proc/loadavg`: `"0.10 0.20 0.15 1/234 5678"`.
pub fn parse_loadavg(content: &str) -> ParsedLoadavg {
    let mut fields = content.split_whitespace();
    ParsedLoadavg {
        load1: fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        load5: fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        load15: fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDiskLine {
    pub device: String,
    pub sectors_read: u64,
    pub sectors_written: u64,
}

/// Parses `/proc/diskstats`. Sector counts are in 512-byte units; callers
/// multiply by 512 to get bytes.
pub fn parse_diskstats(content: &str) -> Vec<RawDiskLine> {
    let mut out = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let device = fields[2].to_owned();
        // Skip loop/ram devices and partitions (keep whole disks only),
        // skipping pseudo-devices without a full
        // mountinfo cross-reference.
        if device.starts_with("loop") || device.starts_with("ram") {
            continue;
        }
        out.push(RawDiskLine {
            device,
            sectors_read: fields[5].parse().unwrap_or(0),
            sectors_written: fields[9].parse().unwrap_or(0),
        });
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawNetLine {
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Parses `/proc/net/dev`.
pub fn parse_net_dev(content: &str) -> Vec<RawNetLine> {
    let mut out = Vec::new();
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 16 {
            continue;
        }
        out.push(RawNetLine {
            interface: name.trim().to_owned(),
            rx_bytes: fields[0],
            rx_packets: fields[1],
            rx_errs: fields[2],
            rx_drop: fields[3],
            tx_bytes: fields[8],
            tx_packets: fields[9],
            tx_errs: fields[10],
            tx_drop: fields[11],
        });
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawProcessStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
}

/// Parses `/proc/[pid]/stat`. The `comm` field is parenthesized and may
/// contain spaces/parens, so we split on the last `)` rather than naive
/// whitespace splitting.
pub fn parse_process_stat(content: &str) -> Option<RawProcessStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid: u32 = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_owned();
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] = state, rest[1] = ppid, ... rest[11]=utime, rest[12]=stime, rest[17]=num_threads
    let ppid: u32 = rest.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let utime: u64 = rest.get(11).and_then(|s| s.parse().ok()).unwrap_or(0);
    let stime: u64 = rest.get(12).and_then(|s| s.parse().ok()).unwrap_or(0);
    let num_threads: u32 = rest.get(17).and_then(|s| s.parse().ok()).unwrap_or(0);
    Some(RawProcessStat {
        pid,
        comm,
        ppid,
        utime,
        stime,
        num_threads,
    })
}

/// Parses `VmRSS` (kB) out of `/proc/[pid]/status`.
pub fn parse_status_rss_kb(content: &str) -> u64 {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest.trim().split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(0);
        }
    }
    0
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedProcessIo {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Parses `/proc/[pid]/io`.
pub fn parse_process_io(content: &str) -> ParsedProcessIo {
    let mut out = ParsedProcessIo::default();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("read_bytes:") {
            out.read_bytes = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("write_bytes:") {
            out.write_bytes = rest.trim().parse().unwrap_or(0);
        }
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawMountLine {
    pub device: String,
    pub mount_path: String,
    pub fs_type: String,
}

/// Parses `/proc/mounts`: `"device mount_path fs_type options dump pass"`.
pub fn parse_mounts(content: &str) -> Vec<RawMountLine> {
    let mut out = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_path), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        out.push(RawMountLine {
            device: device.to_owned(),
            mount_path: mount_path.to_owned(),
            fs_type: fs_type.to_owned(),
        });
    }
    out
}

/// Parses the real uid out of the `Uid:` line of `/proc/[pid]/status`
/// (`"Uid:\treal\teffective\tsaved\tfilesystem"`).
pub fn parse_status_uid(content: &str) -> Option<u32> {
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            return rest.trim().split_whitespace().next()?.parse().ok();
        }
    }
    None
}

/// Resolves a uid to a username from `/etc/passwd` content
/// (`"name:x:uid:gid:gecos:home:shell"`).
pub fn resolve_username_from_passwd(passwd: &str, uid: u32) -> Option<String> {
    for line in passwd.lines() {
        let mut fields = line.split(':');
        let name = fields.next()?;
        fields.next(); // password placeholder
        let entry_uid: u32 = fields.next()?.parse().ok()?;
        if entry_uid == uid {
            return Some(name.to_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_aggregate_and_percpu() {
        let content = "cpu  100 10 50 800 5 0 2 0 0 0\ncpu0 50 5 25 400 2 0 1 0 0 0\nctxt 123456\nintr 99999 0 0\nprocesses 42\n";
        let stat = parse_stat(content);
        assert_eq!(stat.cpus.len(), 2);
        assert_eq!(stat.cpus[0].cpu_id, None);
        assert_eq!(stat.cpus[0].user, 100);
        assert_eq!(stat.cpus[1].cpu_id, Some(0));
        assert_eq!(stat.ctxt, 123456);
        assert_eq!(stat.interrupts_total, 99999);
    }

    #[test]
    fn parses_meminfo() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8000000 kB\nBuffers:          100000 kB\nCached:          2000000 kB\nSwapTotal:       2048000 kB\nSwapFree:        2048000 kB\n";
        let info = parse_meminfo(content);
        assert_eq!(info.mem_total_kb, 16384000);
        assert_eq!(info.mem_available_kb, 8000000);
    }

    #[test]
    fn parses_loadavg() {
        let info = parse_loadavg("0.52 0.58 0.59 2/543 12345\n");
        assert!((info.load1 - 0.52).abs() < 1e-9);
        assert!((info.load15 - 0.59).abs() < 1e-9);
    }

    #[test]
    fn parses_process_stat_with_spaces_in_comm() {
        let line = "1234 (my process) S 1 1234 1234 0 -1 4194304 100 0 0 0 500 200 0 0 20 0 4 0 1000 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let parsed = parse_process_stat(line).unwrap();
        assert_eq!(parsed.pid, 1234);
        assert_eq!(parsed.comm, "my process");
        assert_eq!(parsed.utime, 500);
        assert_eq!(parsed.stime, 200);
    }

    #[test]
    fn parses_mounts_skips_malformed_lines() {
        let content = "/dev/sda1 / ext4 rw,relatime 0 0\noverlay /var/lib/docker/overlay2 overlay rw 0 0\n\n";
        let mounts = parse_mounts(content);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].device, "/dev/sda1");
        assert_eq!(mounts[0].mount_path, "/");
    }

    #[test]
    fn parses_status_uid_takes_real_uid() {
        let content = "Name:\tbash\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(parse_status_uid(content), Some(1000));
    }

    #[test]
    fn resolves_username_from_passwd() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000:Alice:/home/alice:/bin/bash\n";
        assert_eq!(
            resolve_username_from_passwd(passwd, 1000),
            Some("alice".to_owned())
        );
        assert_eq!(resolve_username_from_passwd(passwd, 9999), None);
    }

    #[test]
    fn parses_net_dev_skips_header() {
        let content = "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n  eth0: 1000 10 0 0 0 0 0 0 500 5 0 0 0 0 0 0\n    lo:  200  2 0 0 0 0 0 0 200 2 0 0 0 0 0 0\n";
        let lines = parse_net_dev(content);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].interface, "eth0");
        assert_eq!(lines[0].rx_bytes, 1000);
        assert_eq!(lines[0].tx_bytes, 500);
    }
}
