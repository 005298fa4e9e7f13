//! sysmon-aggregatord - fleet aggregator: ingest, host registry, query API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use sysmon_core::config::{self, AggregatorConfig};
use sysmon_core::registry::HostRegistry;
use sysmon_core::storage::{RetentionPolicy, StoreConfig, TimeSeriesStore};

mod auth;
mod handlers;
mod state;

use auth::IngestTokenLayer;
use state::{AppState, AppStateInner};

/// Host monitoring aggregator: ingest endpoint, fleet registry, query API.
#[derive(Parser)]
#[command(name = "sysmon-aggregatord", about = "Host monitoring aggregator", version)]
struct Args {
    /// Path to the aggregator configuration file.
    #[arg(short, long, default_value = "/etc/sysmon/aggregator.yaml", env = "SYSMON_AGGREGATOR_CONFIG")]
    config: String,

    /// Overrides the configured bind address.
    #[arg(long, env = "SYSMON_AGGREGATOR_BIND")]
    bind: Option<String>,

    /// Overrides the configured database path.
    #[arg(long, env = "SYSMON_AGGREGATOR_DB")]
    db_path: Option<String>,

    /// Overrides the configured ingest token. Required in some form for the
    /// process to start — ingest must be authenticated.
    #[arg(long, env = "SYSMON_INGEST_TOKEN")]
    ingest_token: Option<String>,

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

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sysmon_aggregatord={level}").parse().unwrap())
        .add_directive(format!("sysmon_core={level}").parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("sysmon-aggregatord {} starting", env!("CARGO_PKG_VERSION"));

    let mut agg_config = match config::load_aggregator_config(std::path::Path::new(&args.config)) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to load aggregator config from {}: {} (using defaults)", args.config, e);
            AggregatorConfig::default()
        }
    };

    if let Some(bind) = &args.bind {
        agg_config.bind_addr = bind.clone();
    }
    if let Some(db_path) = &args.db_path {
        agg_config.db_path = db_path.clone();
    }
    if let Some(token) = &args.ingest_token {
        agg_config.ingest_token = Some(token.clone());
    }

    let ingest_token = match agg_config.ingest_token.clone().filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => {
            error!("no ingest token configured; refusing to start with an open ingest endpoint");
            std::process::exit(1);
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(agg_config, ingest_token));
}

async fn async_main(agg_config: AggregatorConfig, ingest_token: String) {
    let store_config = StoreConfig {
        db_path: agg_config.expanded_db_path(),
        retention: RetentionPolicy { raw_retention_days: agg_config.retention_days, ..RetentionPolicy::default() },
        ..StoreConfig::new(agg_config.expanded_db_path())
    };
    let store = match TimeSeriesStore::open(store_config) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to open aggregator store: {}", e);
            std::process::exit(1);
        }
    };

    let registry = HostRegistry::new(agg_config.inactive_threshold_seconds);
    if let Err(e) = registry.load_from(&store) {
        error!("failed to load host registry from store: {}", e);
        std::process::exit(1);
    }

    let state: AppState = Arc::new(AppStateInner {
        store,
        registry,
        started_at: Instant::now(),
        inactive_threshold_seconds: agg_config.inactive_threshold_seconds,
    });

    let retention_policy = RetentionPolicy { raw_retention_days: agg_config.retention_days, ..RetentionPolicy::default() };
    spawn_retention_task(state.clone(), retention_policy);

    let app = Router::new()
        .route("/api/metrics", post(handlers::ingest_metrics))
        .route("/api/metrics", get(handlers::query_metrics))
        .route("/api/hosts", get(handlers::list_hosts))
        .route("/api/latest", get(handlers::latest_sample))
        .route("/api/fleet/summary", get(handlers::fleet_summary))
        .route("/api/health", get(handlers::health))
        .with_state(state)
        .layer(IngestTokenLayer { token: Arc::new(ingest_token) })
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = agg_config.bind_addr.parse().expect("invalid bind address");
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}

/// One retention/rollup thread, run out-of-band from request handling.
/// `run_retention` is synchronous so it runs via `spawn_blocking`.
fn spawn_retention_task(state: AppState, policy: RetentionPolicy) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let state = state.clone();
            let result = tokio::task::spawn_blocking(move || {
                let now = handlers::now_unix();
                state.store.run_retention(now, &policy)
            })
            .await;
            match result {
                Ok(Ok(pruned)) => debug!(pruned, "retention sweep completed"),
                Ok(Err(e)) => warn!(error = %e, "retention sweep failed"),
                Err(e) => error!(error = %e, "retention task panicked"),
            }
        }
    });
}
