//! Platform probing, time-series storage, alerting, publishing, and
//! fleet registry shared by the `sysmon-agent`, `sysmon-aggregator`, and
//! `sysmon-cli` binaries.
//!
//! This crate never initializes a `tracing` subscriber; it only emits
//! events. Binaries own subscriber setup.

pub mod alert;
pub mod collector;
pub mod config;
pub mod error;
pub mod probe;
pub mod publisher;
pub mod registry;
pub mod ringqueue;
pub mod sample;
pub mod storage;

pub use error::{ConfigError, ErrorKind, ProbeError, SinkError, StorageError};
pub use probe::{default_probe, Probe};
pub use sample::MetricSample;
