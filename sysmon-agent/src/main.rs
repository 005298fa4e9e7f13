//! sysmond - host monitoring agent.
//!
//! Samples platform metrics on a fixed interval, stores them in an
//! embedded time-series database, evaluates alert rules, and optionally
//! publishes batches to an aggregator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use sysmon_core::alert::{build_sink, AlertEngine};
use sysmon_core::collector::{Collector, CollectorConfig};
use sysmon_core::config::{self, AgentMode};
use sysmon_core::publisher::{NetworkPublisher, PublisherConfig};
use sysmon_core::storage::{RetentionPolicy, StoreConfig, TimeSeriesStore};

/// Host monitoring agent.
#[derive(Parser)]
#[command(name = "sysmond", about = "Host monitoring agent", version)]
struct Args {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "/etc/sysmon/agent.yaml", env = "SYSMON_AGENT_CONFIG")]
    config: String,

    /// Path to the alert rule configuration file. Alerting is disabled if
    /// omitted.
    #[arg(long, env = "SYSMON_ALERT_RULES")]
    alert_rules: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(format!("sysmond={level}").parse().unwrap()).add_directive(format!("sysmon_core={level}").parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("sysmond {} starting", env!("CARGO_PKG_VERSION"));

    let agent_config = match config::load_agent_config(std::path::Path::new(&args.config)) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load agent config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let mode = match agent_config.mode() {
        Ok(m) => m,
        Err(e) => {
            error!("invalid agent mode: {}", e);
            std::process::exit(1);
        }
    };

    let hostname = agent_config.resolved_hostname();
    info!("mode={:?} hostname={}", mode_label(mode), hostname);

    let store = if matches!(mode, AgentMode::Local | AgentMode::Hybrid) {
        let store_config = StoreConfig {
            db_path: agent_config.expanded_db_path(),
            batch_max: agent_config.storage.batch_size,
            flush_interval: Duration::from_secs(agent_config.storage.flush_seconds),
            retention: RetentionPolicy { raw_retention_days: agent_config.storage.retention_days, ..RetentionPolicy::default() },
            ..StoreConfig::new(agent_config.expanded_db_path())
        };
        match TimeSeriesStore::open(store_config) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                error!("failed to open local store: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let store = store.unwrap_or_else(|| {
        // Distributed-only mode: the Collector still needs a store handle
        // to satisfy its contract (append is always non-blocking), so we
        // point it at an ephemeral database that nothing ever queries.
        let path = std::env::temp_dir().join(format!("sysmon-distributed-{}.db", std::process::id()));
        Arc::new(TimeSeriesStore::open(StoreConfig::new(path)).expect("ephemeral store always opens"))
    });

    let alert_engine = Arc::new(AlertEngine::new(hostname.clone()));
    if let Some(rules_path) = &args.alert_rules {
        match alert_engine.load_rules(std::path::Path::new(rules_path)) {
            Ok(loaded) => {
                for (name, sink_config) in &loaded.sinks {
                    if !sink_config.enabled {
                        continue;
                    }
                    match build_sink(sink_config, 10 * 1024 * 1024) {
                        Ok(sink) => alert_engine.register_sink(name, sink),
                        Err(e) => warn!("failed to build sink '{}': {}", name, e),
                    }
                }
                info!("loaded {} alert rules, {} sinks", loaded.rules.len(), loaded.sinks.len());
            }
            Err(e) => warn!("failed to load alert rules from {}: {} (alerting disabled)", rules_path, e),
        }
    }

    let publisher = if matches!(mode, AgentMode::Distributed | AgentMode::Hybrid) {
        let aggregator_url = agent_config.aggregator_url.clone().unwrap_or_default();
        let auth_token = agent_config.auth_token.clone().unwrap_or_default();
        let publisher_config = PublisherConfig {
            aggregator_url,
            auth_token,
            hostname: hostname.clone(),
            host_tags: agent_config.tags.clone(),
            push_interval: Duration::from_millis(agent_config.push_interval_ms),
            batch_max: agent_config.storage.batch_size,
            queue_capacity: agent_config.queue_capacity,
            http_timeout: Duration::from_millis(agent_config.http_timeout_ms),
            retry_max_attempts: agent_config.retry_max_attempts,
            retry_base_delay: Duration::from_millis(agent_config.retry_base_delay_ms),
        };
        Some(Arc::new(NetworkPublisher::start(publisher_config)))
    } else {
        None
    };

    let probe = sysmon_core::default_probe();
    let collector_config = CollectorConfig { interval: Duration::from_millis(agent_config.collection_interval_ms), hostname: hostname.clone(), ..CollectorConfig::default() };
    let collector = Collector::new(collector_config, probe, store.clone(), alert_engine.clone(), publisher.clone());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {}", e);
    }

    info!("starting collection loop");
    let mut running_collector = collector.start();

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("stopping collector");
    running_collector.stop();

    drop(publisher);
    debug!("final store queue depth: {}", store.queue_depth());
    drop(store);

    info!("sysmond stopped");
}

fn mode_label(mode: AgentMode) -> &'static str {
    match mode {
        AgentMode::Local => "local",
        AgentMode::Distributed => "distributed",
        AgentMode::Hybrid => "hybrid",
    }
}
