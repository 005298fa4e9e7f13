//! sysmonctl - read-only inspection of a sysmon time-series database.
//!
//! A thin binary that opens the storage layer directly (no daemon
//! involved) and prints either a plain table or `--json`, one subcommand
//! per query the store exposes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use sysmon_core::storage::{AggregateFn, StoreConfig, TimeSeriesStore};

#[derive(Parser)]
#[command(name = "sysmonctl", about = "Inspect a sysmon time-series database", version)]
struct Cli {
    /// Path to the sysmon database file.
    #[arg(short, long, default_value = "~/.sysmon/data.db", env = "SYSMON_DB_PATH")]
    db_path: String,

    /// Output as JSON instead of a plain table.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List known hosts.
    Hosts,
    /// List distinct metric types recorded in the database.
    MetricTypes,
    /// Show the most recent sample for a metric.
    Latest {
        /// Metric type, e.g. "cpu.total_usage".
        metric: String,
        /// Restrict to one host.
        #[arg(long)]
        host: Option<String>,
    },
    /// Query a time range for a metric.
    Range {
        metric: String,
        /// Unix timestamp, inclusive.
        start: i64,
        /// Unix timestamp, inclusive.
        end: i64,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Bucketed aggregation over a time range.
    Aggregate {
        metric: String,
        start: i64,
        end: i64,
        /// Bucket width, in seconds.
        #[arg(long, default_value_t = 60)]
        bucket_seconds: i64,
        #[arg(long, default_value = "avg")]
        func: String,
        #[arg(long)]
        host: Option<String>,
    },
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn fmt_ts(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn parse_agg_fn(name: &str) -> Result<AggregateFn, String> {
    match name.to_ascii_lowercase().as_str() {
        "avg" => Ok(AggregateFn::Avg),
        "min" => Ok(AggregateFn::Min),
        "max" => Ok(AggregateFn::Max),
        "sum" => Ok(AggregateFn::Sum),
        other => Err(format!("unknown aggregate function '{other}' (expected avg, min, max, sum)")),
    }
}

fn open_store(db_path: &str) -> TimeSeriesStore {
    let path = expand_home(db_path);
    TimeSeriesStore::open(StoreConfig::new(path)).unwrap_or_else(|e| {
        eprintln!("failed to open database: {e}");
        std::process::exit(1);
    })
}

#[derive(Serialize)]
struct SampleJson {
    timestamp: i64,
    datetime: String,
    metric_type: String,
    host: String,
    value: f64,
    tags: String,
}

fn main() {
    let cli = Cli::parse();
    let store = open_store(&cli.db_path);

    match &cli.command {
        Command::Hosts => cmd_hosts(&store, cli.json),
        Command::MetricTypes => cmd_metric_types(&store, cli.json),
        Command::Latest { metric, host } => cmd_latest(&store, metric, host.as_deref(), cli.json),
        Command::Range { metric, start, end, host, limit } => cmd_range(&store, metric, *start, *end, host.as_deref(), *limit, cli.json),
        Command::Aggregate { metric, start, end, bucket_seconds, func, host } => {
            cmd_aggregate(&store, metric, *start, *end, *bucket_seconds, func, host.as_deref(), cli.json)
        }
    }
}

fn cmd_hosts(store: &TimeSeriesStore, json: bool) {
    let hosts = store.hosts().unwrap_or_else(|e| {
        eprintln!("query failed: {e}");
        std::process::exit(1);
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&hosts).unwrap());
    } else {
        for host in &hosts {
            println!("{host}");
        }
        println!("\n{} host(s)", hosts.len());
    }
}

fn cmd_metric_types(store: &TimeSeriesStore, json: bool) {
    let types = store.metric_types().unwrap_or_else(|e| {
        eprintln!("query failed: {e}");
        std::process::exit(1);
    });
    if json {
        println!("{}", serde_json::to_string_pretty(&types).unwrap());
    } else {
        for t in &types {
            println!("{t}");
        }
        println!("\n{} metric type(s)", types.len());
    }
}

fn cmd_latest(store: &TimeSeriesStore, metric: &str, host: Option<&str>, json: bool) {
    let sample = store.query_latest(metric, host).unwrap_or_else(|e| {
        eprintln!("query failed: {e}");
        std::process::exit(1);
    });
    let Some(sample) = sample else {
        if json {
            println!("null");
        } else {
            println!("no samples found for metric '{metric}'");
        }
        return;
    };
    let tags = sample.tags_encoded();
    let out = SampleJson {
        timestamp: sample.timestamp,
        datetime: fmt_ts(sample.timestamp),
        metric_type: sample.metric_type,
        host: sample.host,
        value: sample.value,
        tags,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&out).unwrap());
    } else {
        println!("{}  {}  {}={}  [{}]", out.datetime, out.host, out.metric_type, out.value, out.tags);
    }
}

fn cmd_range(store: &TimeSeriesStore, metric: &str, start: i64, end: i64, host: Option<&str>, limit: Option<usize>, json: bool) {
    let samples = store.query_range(metric, start, end, limit, host).unwrap_or_else(|e| {
        eprintln!("query failed: {e}");
        std::process::exit(1);
    });
    if json {
        let out: Vec<SampleJson> = samples
            .into_iter()
            .map(|s| {
                let tags = s.tags_encoded();
                SampleJson { timestamp: s.timestamp, datetime: fmt_ts(s.timestamp), metric_type: s.metric_type, host: s.host, value: s.value, tags }
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out).unwrap());
    } else {
        for s in &samples {
            println!("{}  {}  {}={}", fmt_ts(s.timestamp), s.host, s.metric_type, s.value);
        }
        println!("\n{} sample(s)", samples.len());
    }
}

#[derive(Serialize)]
struct BucketJson {
    timestamp: i64,
    datetime: String,
    value: f64,
}

fn cmd_aggregate(store: &TimeSeriesStore, metric: &str, start: i64, end: i64, bucket_seconds: i64, func: &str, host: Option<&str>, json: bool) {
    let agg_fn = parse_agg_fn(func).unwrap_or_else(|e| {
        eprintln!("{e}");
        std::process::exit(1);
    });
    let buckets = store.aggregate(metric, start, end, bucket_seconds, agg_fn, host).unwrap_or_else(|e| {
        eprintln!("query failed: {e}");
        std::process::exit(1);
    });
    if json {
        let out: Vec<BucketJson> = buckets.into_iter().map(|(ts, v)| BucketJson { timestamp: ts, datetime: fmt_ts(ts), value: v }).collect();
        println!("{}", serde_json::to_string_pretty(&out).unwrap());
    } else {
        for (ts, v) in &buckets {
            println!("{}  {:.3}", fmt_ts(*ts), v);
        }
        println!("\n{} bucket(s)", buckets.len());
    }
}
