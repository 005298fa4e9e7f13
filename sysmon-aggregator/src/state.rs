//! Shared application state handed to every handler via `axum::State`.

use std::sync::Arc;
use std::time::Instant;

use sysmon_core::registry::HostRegistry;
use sysmon_core::storage::TimeSeriesStore;

pub struct AppStateInner {
    pub store: TimeSeriesStore,
    pub registry: HostRegistry,
    pub started_at: Instant,
    pub inactive_threshold_seconds: i64,
}

pub type AppState = Arc<AppStateInner>;
