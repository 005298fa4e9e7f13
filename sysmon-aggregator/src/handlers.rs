//! HTTP handlers for the aggregator's ingest and read endpoints: one
//! `async fn` per route returning `Json<T>` or a typed error status.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sysmon_core::error::StorageError;
use sysmon_core::sample::{decode_tags, MetricSample};

use crate::state::AppState;

pub(crate) fn now_unix() -> i64 {
    // The aggregator is the one component allowed a wall clock read on the
    // request path; nothing here is pure/testable by design
    // health/liveness needs real time).
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================
// POST /api/metrics
// ============================================================

#[derive(Deserialize)]
pub struct IngestMetric {
    pub timestamp: i64,
    pub metric_type: String,
    pub value: f64,
    #[serde(default)]
    pub tags: String,
}

#[derive(Deserialize)]
pub struct IngestEnvelope {
    pub hostname: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub metrics: Vec<IngestMetric>,
}

#[derive(Serialize)]
struct IngestOk {
    accepted: usize,
    rejected: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct WriteFailedBody {
    error: &'static str,
    retry_after_ms: u64,
}

pub async fn ingest_metrics(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let envelope: IngestEnvelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: e.to_string() })).into_response();
        }
    };

    if envelope.hostname.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: "hostname is required".into() })).into_response();
    }

    let mut accepted = Vec::with_capacity(envelope.metrics.len());
    let mut rejected = 0usize;
    for m in &envelope.metrics {
        if !m.value.is_finite() || m.metric_type.is_empty() {
            rejected += 1;
            continue;
        }
        let mut sample = MetricSample::new(m.timestamp, m.metric_type.clone(), envelope.hostname.clone(), m.value);
        sample.tags = decode_tags(&m.tags);
        accepted.push(sample);
    }

    let now = now_unix();

    // All-or-nothing: append_many enqueues the whole batch atomically, so a
    // queue-overflow error here means none of `accepted` was admitted.
    let accepted_count = accepted.len();
    if !accepted.is_empty() {
        if let Err(e) = state.store.append_many(accepted) {
            warn!(error = %e, host = %envelope.hostname, "ingest write failed, batch dropped");
            let retry_after_ms = match e {
                StorageError::Overflow => 500,
                StorageError::Unavailable => 2000,
                _ => 1000,
            };
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WriteFailedBody { error: "write_failed", retry_after_ms }),
            )
                .into_response();
        }
    }

    if let Err(e) = state.registry.upsert(
        &state.store,
        &envelope.hostname,
        now,
        envelope.platform.as_deref(),
        envelope.version.as_deref(),
        &envelope.tags,
    ) {
        warn!(error = %e, host = %envelope.hostname, "host registry upsert failed");
    }

    debug!(host = %envelope.hostname, accepted = accepted_count, rejected, "ingest batch processed");
    (StatusCode::OK, Json(IngestOk { accepted: accepted_count, rejected })).into_response()
}

// ============================================================
// GET /api/hosts
// ============================================================

#[derive(Deserialize)]
pub struct HostsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Serialize)]
struct HostEntry {
    hostname: String,
    last_seen: i64,
    status: &'static str,
    tags: HashMap<String, String>,
    version: String,
}

#[derive(Serialize)]
pub(crate) struct HostsResponse {
    hosts: Vec<HostEntry>,
    count: usize,
    online: usize,
    offline: usize,
}

pub async fn list_hosts(State(state): State<AppState>, Query(query): Query<HostsQuery>) -> Json<HostsResponse> {
    let now = now_unix();
    let descriptors = state.registry.list(now, query.include_inactive);
    let online = descriptors.iter().filter(|d| d.is_online(now, state.inactive_threshold_seconds)).count();
    let offline = descriptors.len() - online;
    let hosts = descriptors
        .into_iter()
        .map(|d| {
            let status = if d.is_online(now, state.inactive_threshold_seconds) { "online" } else { "offline" };
            HostEntry { hostname: d.hostname, last_seen: d.last_seen, status, tags: d.tags, version: d.version }
        })
        .collect();
    Json(HostsResponse { hosts, count: online + offline, online, offline })
}

// ============================================================
// GET /api/latest
// ============================================================

#[derive(Deserialize)]
pub struct LatestQuery {
    pub metric: String,
    pub host: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct LatestResponse {
    timestamp: i64,
    metric_type: String,
    host: String,
    value: f64,
    tags: String,
}

pub async fn latest_sample(State(state): State<AppState>, Query(query): Query<LatestQuery>) -> Result<Json<LatestResponse>, StatusCode> {
    let sample = state
        .store
        .query_latest(&query.metric, query.host.as_deref())
        .map_err(|e| {
            warn!(error = %e, "query_latest failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let tags = sample.tags_encoded();
    Ok(Json(LatestResponse {
        timestamp: sample.timestamp,
        metric_type: sample.metric_type,
        host: sample.host,
        value: sample.value,
        tags,
    }))
}

// ============================================================
// GET /api/metrics (range query)
// ============================================================

#[derive(Deserialize)]
pub struct RangeQuery {
    pub host: Option<String>,
    pub metric_type: String,
    pub start: i64,
    pub end: i64,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
struct DataPoint {
    timestamp: i64,
    value: f64,
    datetime: String,
}

#[derive(Serialize)]
struct Statistics {
    min: f64,
    max: f64,
    avg: f64,
    latest: f64,
}

#[derive(Serialize)]
pub(crate) struct RangeResponse {
    metric_type: String,
    count: usize,
    data: Vec<DataPoint>,
    statistics: Option<Statistics>,
}

pub async fn query_metrics(State(state): State<AppState>, Query(query): Query<RangeQuery>) -> Result<Json<RangeResponse>, StatusCode> {
    if query.end < query.start {
        return Err(StatusCode::BAD_REQUEST);
    }
    let samples = state
        .store
        .query_range(&query.metric_type, query.start, query.end, query.limit, query.host.as_deref())
        .map_err(|e| {
            warn!(error = %e, "query_range failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let statistics = samples.first().map(|_| {
        let min = samples.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
        let max = samples.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max);
        let avg = samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64;
        let latest = samples.last().unwrap().value;
        Statistics { min, max, avg, latest }
    });

    let data = samples
        .iter()
        .map(|s| DataPoint { timestamp: s.timestamp, value: s.value, datetime: format_datetime(s.timestamp) })
        .collect::<Vec<_>>();

    Ok(Json(RangeResponse { metric_type: query.metric_type, count: data.len(), data, statistics }))
}

fn format_datetime(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

// ============================================================
// GET /api/fleet/summary
// ============================================================

#[derive(Serialize)]
pub(crate) struct FleetSummary {
    total_hosts: usize,
    online_hosts: usize,
    offline_hosts: usize,
    avg_cpu_percent: f64,
    total_memory_used_gb: f64,
    timestamp: i64,
}

pub async fn fleet_summary(State(state): State<AppState>) -> Json<FleetSummary> {
    let now = now_unix();
    let all = state.registry.list(now, true);
    let online: Vec<_> = all.iter().filter(|d| d.is_online(now, state.inactive_threshold_seconds)).collect();

    let mut cpu_values = Vec::new();
    let mut total_memory_bytes = 0.0f64;

    for host in &online {
        if let Ok(Some(sample)) = state.store.query_latest("cpu.total_usage", Some(&host.hostname)) {
            cpu_values.push(sample.value);
        }
        if let Ok(Some(sample)) = state.store.query_latest("memory.used_bytes", Some(&host.hostname)) {
            total_memory_bytes += sample.value;
        }
    }

    let avg_cpu_percent = if cpu_values.is_empty() { 0.0 } else { cpu_values.iter().sum::<f64>() / cpu_values.len() as f64 };

    Json(FleetSummary {
        total_hosts: all.len(),
        online_hosts: online.len(),
        offline_hosts: all.len() - online.len(),
        avg_cpu_percent,
        total_memory_used_gb: total_memory_bytes / (1024.0 * 1024.0 * 1024.0),
        timestamp: now,
    })
}

// ============================================================
// GET /api/health
// ============================================================

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
