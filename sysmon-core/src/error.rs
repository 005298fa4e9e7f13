//! Shared error vocabulary.
//!
//! Every component-specific error enum exposes a `kind()` method that maps
//! onto this closed set. Callers match on `kind()` to decide policy
//! (retry, log-once-and-suppress, disable-permanently, propagate-fatal)
//! without needing to know about every concrete error type in the tree.

use std::fmt;

/// The five error kinds every component surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable; the underlying resource should recover soon.
    Transient,
    /// Malformed configuration or schema.
    Config,
    /// The OS denied access to a resource.
    Permission,
    /// The capability does not exist on this platform.
    NotSupported,
    /// Invariant broken; unsafe to continue.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Config => "config",
            ErrorKind::Permission => "permission",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Error returned by a `Probe` accessor.
#[derive(Debug, Clone)]
pub enum ProbeError {
    /// OS denied access to the resource (e.g. `/proc/[pid]/io` for a
    /// process owned by another user).
    Permission(String),
    /// The capability does not exist on this platform.
    NotSupported(String),
    /// Recoverable I/O or parse failure; retry on the next tick.
    Transient(String),
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Permission(_) => ErrorKind::Permission,
            ProbeError::NotSupported(_) => ErrorKind::NotSupported,
            ProbeError::Transient(_) => ErrorKind::Transient,
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Permission(msg) => write!(f, "permission denied: {msg}"),
            ProbeError::NotSupported(msg) => write!(f, "not supported: {msg}"),
            ProbeError::Transient(msg) => write!(f, "transient probe error: {msg}"),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => ProbeError::Permission(e.to_string()),
            std::io::ErrorKind::NotFound => ProbeError::NotSupported(e.to_string()),
            _ => ProbeError::Transient(e.to_string()),
        }
    }
}

/// Error returned by `TimeSeriesStore` operations.
#[derive(Debug)]
pub enum StorageError {
    /// The ingest queue is full; caller must decide (drop, meter, escalate).
    Overflow,
    /// The store has entered `Degraded` state after repeated commit failure.
    Unavailable,
    /// Underlying SQL engine error (open, migrate, or query failure).
    Backend(String),
    /// Malformed schema or migration state.
    Config(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Overflow => ErrorKind::Transient,
            StorageError::Unavailable => ErrorKind::Transient,
            StorageError::Backend(_) => ErrorKind::Transient,
            StorageError::Config(_) => ErrorKind::Config,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Overflow => write!(f, "ingest queue full"),
            StorageError::Unavailable => write!(f, "store degraded, unavailable"),
            StorageError::Backend(msg) => write!(f, "storage backend error: {msg}"),
            StorageError::Config(msg) => write!(f, "storage config error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Error returned while loading/parsing alert rule configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    /// A rule referenced a sink name that was never registered, or two
    /// rules share a name. The loader rejects the entire file on this.
    Referential(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config I/O error: {msg}"),
            ConfigError::Parse(msg) => write!(f, "config parse error: {msg}"),
            ConfigError::Referential(msg) => write!(f, "config referential error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Error returned by a `NotificationSink::send`.
#[derive(Debug)]
pub enum SinkError {
    /// The remote endpoint returned a non-2xx response, or the transport
    /// otherwise failed to deliver the notification.
    Remote(String),
    /// Local I/O failure (e.g. writing the log sink's file).
    Io(String),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Remote(msg) => write!(f, "sink remote error: {msg}"),
            SinkError::Io(msg) => write!(f, "sink I/O error: {msg}"),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}
