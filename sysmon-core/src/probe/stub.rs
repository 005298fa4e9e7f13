//! Fallback probe for platforms without a fully implemented backend.
//!
//! Every accessor reports `NotSupported`; the Collector treats that as a
//! permanent absence and stops asking. Keeping this as a real,
//! always-compiling implementation — rather than `#[cfg]`-ing the whole
//! `Probe` trait away — is what lets `sysmon-core` build on any host even
//! before a platform gets a real backend (darwin, windows).

use super::{CpuSnapshot, DiskSnapshot, MemorySnapshot, NetworkSnapshot, Probe, ProcessEntry};
use crate::error::ProbeError;

#[derive(Default)]
pub struct StubProbe {
    platform_name: &'static str,
}

impl StubProbe {
    pub fn new() -> Self {
        Self {
            platform_name: Self::detect_name(),
        }
    }

    #[cfg(target_os = "macos")]
    fn detect_name() -> &'static str {
        "macOS"
    }

    #[cfg(target_os = "windows")]
    fn detect_name() -> &'static str {
        "Windows"
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    fn detect_name() -> &'static str {
        "Unknown"
    }

    fn unsupported(&self, family: &str) -> ProbeError {
        ProbeError::NotSupported(format!("{family} is not implemented on {}", self.platform_name))
    }
}

impl Probe for StubProbe {
    fn cpu(&mut self) -> Result<CpuSnapshot, ProbeError> {
        Err(self.unsupported("cpu"))
    }

    fn memory(&mut self) -> Result<MemorySnapshot, ProbeError> {
        Err(self.unsupported("memory"))
    }

    fn disks(&mut self) -> Result<Vec<DiskSnapshot>, ProbeError> {
        Err(self.unsupported("disks"))
    }

    fn networks(&mut self) -> Result<Vec<NetworkSnapshot>, ProbeError> {
        Err(self.unsupported("networks"))
    }

    fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError> {
        Err(self.unsupported("processes"))
    }
}
