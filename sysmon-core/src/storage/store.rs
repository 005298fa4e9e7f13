//! `TimeSeriesStore`: an embedded, append-only time series backed by
//! `rusqlite`, with a single background writer thread draining a bounded
//! queue in batched transactions.
//!
//! One owner of the database handle, a rotation/retention policy, and
//! WAL-style recovery on open, over a plain SQL schema rather than an
//! opaque chunk format, so range and aggregate queries can be expressed
//! directly in SQL.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::{params, Connection};
use tracing::{debug, error, warn};

use crate::error::StorageError;
use crate::ringqueue::RingQueue;
use crate::sample::{decode_tags, MetricSample};

use super::retention::{self, RetentionPolicy};
use super::schema;

/// Aggregation function for `TimeSeriesStore::aggregate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFn {
    Avg,
    Min,
    Max,
    Sum,
}

impl AggregateFn {
    fn sql(self) -> &'static str {
        match self {
            AggregateFn::Avg => "AVG(value)",
            AggregateFn::Min => "MIN(value)",
            AggregateFn::Max => "MAX(value)",
            AggregateFn::Sum => "SUM(value)",
        }
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_BATCH_MAX: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// After this many consecutive commit failures the writer reopens the
/// database connection.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub queue_capacity: usize,
    pub batch_max: usize,
    pub flush_interval: Duration,
    pub retention: RetentionPolicy,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_max: DEFAULT_BATCH_MAX,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retention: RetentionPolicy::default(),
        }
    }
}

type FlushAck = Sender<()>;

/// A `hosts` table upsert, carried to the writer thread so the table is
/// touched only from the connection the writer owns.
struct HostUpsert {
    hostname: String,
    last_seen: i64,
    first_seen: i64,
    platform: String,
    version: String,
    tags_encoded: String,
    reply: Sender<Result<(), StorageError>>,
}

/// One persisted `hosts` row, as loaded at aggregator startup.
pub struct HostRow {
    pub hostname: String,
    pub last_seen: i64,
    pub first_seen: i64,
    pub platform: String,
    pub version: String,
    pub tags_encoded: String,
}

pub struct TimeSeriesStore {
    queue: Arc<RingQueue<MetricSample>>,
    read_conn: Mutex<Connection>,
    running: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    flush_tx: Sender<FlushAck>,
    host_tx: Sender<HostUpsert>,
    writer: Option<JoinHandle<()>>,
}

impl TimeSeriesStore {
    /// Opens (creating if absent) the database at `config.db_path`, applies
    /// pragmas and migrations, and starts the background writer thread.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Backend(e.to_string()))?;
            }
        }

        let writer_conn = Connection::open(&config.db_path)?;
        schema::apply_pragmas(&writer_conn)?;
        schema::migrate(&writer_conn)?;

        let read_conn = Connection::open(&config.db_path)?;
        schema::apply_pragmas(&read_conn)?;

        let queue = Arc::new(RingQueue::new(config.queue_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let degraded = Arc::new(AtomicBool::new(false));
        let (flush_tx, flush_rx) = mpsc::channel();
        let (host_tx, host_rx) = mpsc::channel();

        let writer = {
            let queue = queue.clone();
            let running = running.clone();
            let degraded = degraded.clone();
            let db_path = config.db_path.clone();
            let batch_max = config.batch_max;
            let flush_interval = config.flush_interval;
            thread::Builder::new()
                .name("sysmon-store-writer".into())
                .spawn(move || {
                    writer_loop(writer_conn, db_path, queue, running, degraded, flush_rx, host_rx, batch_max, flush_interval);
                })
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        Ok(Self {
            queue,
            read_conn: Mutex::new(read_conn),
            running,
            degraded,
            flush_tx,
            host_tx,
            writer: Some(writer),
        })
    }

    /// Upserts a `hosts` row through the store writer thread.
    /// Blocks the caller (a fast HTTP handler thread, not the Collector)
    /// until the writer has applied it.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_host(
        &self,
        hostname: &str,
        last_seen: i64,
        first_seen: i64,
        platform: &str,
        version: &str,
        tags_encoded: &str,
    ) -> Result<(), StorageError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.host_tx
            .send(HostUpsert {
                hostname: hostname.to_owned(),
                last_seen,
                first_seen,
                platform: platform.to_owned(),
                version: version.to_owned(),
                tags_encoded: tags_encoded.to_owned(),
                reply: reply_tx,
            })
            .map_err(|_| StorageError::Unavailable)?;
        reply_rx.recv().map_err(|_| StorageError::Unavailable)?
    }

    /// Loads every persisted `hosts` row. Read-only, so it bypasses the
    /// writer thread and uses the store's dedicated read connection.
    pub fn load_hosts(&self) -> Result<Vec<HostRow>, StorageError> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT hostname, last_seen, first_seen, platform, agent_version, tags FROM hosts")?;
        let rows = stmt.query_map([], |row| {
            Ok(HostRow {
                hostname: row.get(0)?,
                last_seen: row.get(1)?,
                first_seen: row.get(2)?,
                platform: row.get(3)?,
                version: row.get(4)?,
                tags_encoded: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues one sample; never blocks on disk I/O.
    pub fn append(&self, sample: MetricSample) -> Result<(), StorageError> {
        if self.is_degraded() {
            return Err(StorageError::Unavailable);
        }
        self.queue.push(sample).map_err(|_| StorageError::Overflow)
    }

    /// Enqueues a batch atomically: either all samples are accepted or none
    /// are.
    pub fn append_many(&self, samples: Vec<MetricSample>) -> Result<(), StorageError> {
        if self.is_degraded() {
            return Err(StorageError::Unavailable);
        }
        self.queue.push_many(samples).map_err(|_| StorageError::Overflow)
    }

    /// Blocks until every sample enqueued before this call is durable, or
    /// `timeout` elapses.
    pub fn flush(&self, timeout: Duration) -> Result<(), StorageError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.flush_tx
            .send(ack_tx)
            .map_err(|_| StorageError::Unavailable)?;
        ack_rx
            .recv_timeout(timeout)
            .map_err(|_| StorageError::Backend("flush timed out".into()))
    }

    pub fn query_range(
        &self,
        metric_type: &str,
        start_ts: i64,
        end_ts: i64,
        limit: Option<usize>,
        host: Option<&str>,
    ) -> Result<Vec<MetricSample>, StorageError> {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let conn = self.read_conn.lock().unwrap();
        let sql = match host {
            Some(_) => {
                "SELECT timestamp, metric_type, host, tags, value FROM metrics \
                 WHERE metric_type = ?1 AND timestamp BETWEEN ?2 AND ?3 AND host = ?4 \
                 ORDER BY timestamp ASC LIMIT ?5"
            }
            None => {
                "SELECT timestamp, metric_type, host, tags, value FROM metrics \
                 WHERE metric_type = ?1 AND timestamp BETWEEN ?2 AND ?3 \
                 ORDER BY timestamp ASC LIMIT ?5"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = if let Some(host) = host {
            stmt.query_map(params![metric_type, start_ts, end_ts, host, limit as i64], row_to_sample)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![metric_type, start_ts, end_ts, limit as i64], row_to_sample)?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    pub fn query_latest(
        &self,
        metric_type: &str,
        host: Option<&str>,
    ) -> Result<Option<MetricSample>, StorageError> {
        let conn = self.read_conn.lock().unwrap();
        let sql = match host {
            Some(_) => {
                "SELECT timestamp, metric_type, host, tags, value FROM metrics \
                 WHERE metric_type = ?1 AND host = ?2 ORDER BY timestamp DESC LIMIT 1"
            }
            None => {
                "SELECT timestamp, metric_type, host, tags, value FROM metrics \
                 WHERE metric_type = ?1 ORDER BY timestamp DESC LIMIT 1"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let mut rows = if let Some(host) = host {
            stmt.query_map(params![metric_type, host], row_to_sample)?
        } else {
            stmt.query_map(params![metric_type], row_to_sample)?
        };
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn aggregate(
        &self,
        metric_type: &str,
        start_ts: i64,
        end_ts: i64,
        bucket_seconds: i64,
        func: AggregateFn,
        host: Option<&str>,
    ) -> Result<Vec<(i64, f64)>, StorageError> {
        if bucket_seconds <= 0 {
            return Err(StorageError::Config("bucket_seconds must be positive".into()));
        }
        let conn = self.read_conn.lock().unwrap();
        let agg = func.sql();
        let sql = match host {
            Some(_) => format!(
                "SELECT (timestamp / {bucket_seconds}) * {bucket_seconds} AS bucket_ts, {agg} AS agg_value \
                 FROM metrics WHERE metric_type = ?1 AND timestamp BETWEEN ?2 AND ?3 AND host = ?4 \
                 GROUP BY bucket_ts ORDER BY bucket_ts ASC"
            ),
            None => format!(
                "SELECT (timestamp / {bucket_seconds}) * {bucket_seconds} AS bucket_ts, {agg} AS agg_value \
                 FROM metrics WHERE metric_type = ?1 AND timestamp BETWEEN ?2 AND ?3 \
                 GROUP BY bucket_ts ORDER BY bucket_ts ASC"
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = if let Some(host) = host {
            stmt.query_map(params![metric_type, start_ts, end_ts, host], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![metric_type, start_ts, end_ts], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    pub fn metric_types(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT metric_type FROM metrics ORDER BY metric_type")?;
        let rows = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn hosts(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.read_conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT host FROM metrics ORDER BY host")?;
        let rows = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes samples with `timestamp < before_ts`, returning the number
    /// of rows removed. Idempotent: a second call with the same argument
    /// deletes zero rows.
    pub fn prune(&self, before_ts: i64) -> Result<usize, StorageError> {
        let conn = self.read_conn.lock().unwrap();
        let count = conn.execute("DELETE FROM metrics WHERE timestamp < ?1", params![before_ts])?;
        Ok(count)
    }

    /// Runs the configured retention policy against `now`. Intended to be
    /// called periodically (hourly/daily) by the owning binary, not by the
    /// Collector.
    pub fn run_retention(&self, now: i64, policy: &RetentionPolicy) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for action in retention::plan(now, policy) {
            match action {
                retention::RetentionAction::PruneBefore { cutoff_ts } => {
                    deleted += self.prune(cutoff_ts)?;
                }
                // Rollup stages collapse raw rows into coarser aggregates;
                // the core carries the scheduling contract without
                // implementing the lossy rewrite, which is dashboard-facing
                // and out of the core's size budget.
                retention::RetentionAction::RollupToMinute { .. }
                | retention::RetentionAction::RollupToHour { .. } => {}
            }
        }
        Ok(deleted)
    }

    /// Stops the writer thread, flushing any queued samples first. Bounded
    /// by `grace_period`; an unresponsive writer is abandoned.
    pub fn shutdown(&mut self, grace_period: Duration) {
        let _ = self.flush(grace_period);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimeSeriesStore {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSample> {
    let tags_raw: String = row.get(3)?;
    Ok(MetricSample {
        timestamp: row.get(0)?,
        metric_type: row.get(1)?,
        host: row.get(2)?,
        tags: decode_tags(&tags_raw),
        value: row.get(4)?,
    })
}

fn commit_batch(conn: &Connection, batch: &[MetricSample]) -> Result<(), StorageError> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO metrics (timestamp, metric_type, host, tags, value) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for sample in batch {
            stmt.execute(params![
                sample.timestamp,
                sample.metric_type,
                sample.host,
                sample.tags_encoded(),
                sample.value
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn writer_loop(
    mut conn: Connection,
    db_path: PathBuf,
    queue: Arc<RingQueue<MetricSample>>,
    running: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    flush_rx: Receiver<FlushAck>,
    host_rx: Receiver<HostUpsert>,
    batch_max: usize,
    flush_interval: Duration,
) {
    let mut consecutive_failures: u32 = 0;
    // Capping the poll below `flush_interval` keeps host-table upserts (a
    // blocking call from an HTTP handler thread, not the Collector) from
    // waiting behind a long configured flush cadence.
    const HOST_POLL_CAP: Duration = Duration::from_millis(200);
    let poll_interval = flush_interval.min(HOST_POLL_CAP);

    while running.load(Ordering::SeqCst) {
        for req in host_rx.try_iter() {
            let _ = req.reply.send(apply_host_upsert(&conn, &req));
        }

        let mut batch = queue.pop_batch_wait(batch_max, poll_interval);
        let mut acks: Vec<FlushAck> = flush_rx.try_iter().collect();
        if !acks.is_empty() {
            batch.extend(queue.pop_batch(usize::MAX));
        }
        if batch.is_empty() {
            for ack in acks.drain(..) {
                let _ = ack.send(());
            }
            continue;
        }

        match commit_batch(&conn, &batch) {
            Ok(()) => {
                consecutive_failures = 0;
                degraded.store(false, Ordering::Release);
                debug!(count = batch.len(), "committed metric batch");
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "store commit failed");
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    match reopen(&db_path) {
                        Ok(fresh) => {
                            conn = fresh;
                            match commit_batch(&conn, &batch) {
                                Ok(()) => {
                                    consecutive_failures = 0;
                                    degraded.store(false, Ordering::Release);
                                }
                                Err(e) => {
                                    error!(error = %e, "store degraded after reconnect failed commit");
                                    degraded.store(true, Ordering::Release);
                                    requeue(&queue, batch);
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "store degraded: reconnect failed");
                            degraded.store(true, Ordering::Release);
                            requeue(&queue, batch);
                        }
                    }
                } else {
                    requeue(&queue, batch);
                }
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }

    // Final drain on shutdown: commit whatever remains, best-effort.
    let remaining = queue.pop_batch(usize::MAX);
    if !remaining.is_empty() {
        if let Err(e) = commit_batch(&conn, &remaining) {
            error!(error = %e, "final batch commit failed on shutdown");
        }
    }
    for req in host_rx.try_iter() {
        let _ = req.reply.send(apply_host_upsert(&conn, &req));
    }
}

fn apply_host_upsert(conn: &Connection, req: &HostUpsert) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO hosts (hostname, last_seen, first_seen, platform, agent_version, tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(hostname) DO UPDATE SET
            last_seen = excluded.last_seen,
            platform = excluded.platform,
            agent_version = excluded.agent_version,
            tags = excluded.tags",
        params![req.hostname, req.last_seen, req.first_seen, req.platform, req.version, req.tags_encoded],
    )?;
    Ok(())
}

fn requeue(queue: &RingQueue<MetricSample>, batch: Vec<MetricSample>) {
    for sample in batch.into_iter().rev() {
        queue.push_front_evicting_tail(sample);
    }
}

fn reopen(db_path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(db_path)?;
    schema::apply_pragmas(&conn)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> TimeSeriesStore {
        let mut config = StoreConfig::new(dir.join("data.db"));
        config.flush_interval = Duration::from_millis(20);
        config.batch_max = 10;
        TimeSeriesStore::open(config).unwrap()
    }

    #[test]
    fn append_then_flush_then_query_range_round_trips() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..5 {
            store.append(MetricSample::new(i, "cpu.total_usage", "h1", i as f64 * 10.0)).unwrap();
        }
        store.flush(Duration::from_secs(2)).unwrap();

        let rows = store.query_range("cpu.total_usage", 0, 10, None, None).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].timestamp, 0);
        assert_eq!(rows[4].timestamp, 4);
    }

    #[test]
    fn query_latest_returns_most_recent_sample() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..3 {
            store.append(MetricSample::new(i, "memory.used_bytes", "h1", i as f64)).unwrap();
        }
        store.flush(Duration::from_secs(2)).unwrap();
        let latest = store.query_latest("memory.used_bytes", None).unwrap().unwrap();
        assert_eq!(latest.timestamp, 2);
    }

    #[test]
    fn aggregate_buckets_and_averages() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        for (ts, v) in [(0, 10.0), (1, 20.0), (2, 30.0), (60, 100.0)] {
            store.append(MetricSample::new(ts, "m", "h1", v)).unwrap();
        }
        store.flush(Duration::from_secs(2)).unwrap();
        let buckets = store.aggregate("m", 0, 60, 60, AggregateFn::Avg, None).unwrap();
        assert_eq!(buckets.len(), 2);
        assert!((buckets[0].1 - 20.0).abs() < 1e-9);
        assert!((buckets[1].1 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn prune_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..3 {
            store.append(MetricSample::new(i, "m", "h1", 1.0)).unwrap();
        }
        store.flush(Duration::from_secs(2)).unwrap();
        let first = store.prune(2).unwrap();
        let second = store.prune(2).unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 0);
    }

    #[test]
    fn query_range_returns_ascending_values_for_single_host() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(MetricSample::new(1, "m", "H", 10.0)).unwrap();
        store.append(MetricSample::new(2, "m", "H", 20.0)).unwrap();
        store.append(MetricSample::new(3, "m", "H", 30.0)).unwrap();
        store.flush(Duration::from_secs(2)).unwrap();

        let rows = store.query_range("m", 1, 3, None, Some("H")).unwrap();
        assert_eq!(rows.len(), 3);
        let values: Vec<f64> = rows.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn append_many_rejects_whole_batch_on_overflow() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path().join("data.db"));
        config.queue_capacity = 2;
        let store = TimeSeriesStore::open(config).unwrap();
        let batch = vec![
            MetricSample::new(1, "m", "h", 1.0),
            MetricSample::new(2, "m", "h", 2.0),
            MetricSample::new(3, "m", "h", 3.0),
        ];
        assert!(matches!(store.append_many(batch), Err(StorageError::Overflow)));
    }
}
