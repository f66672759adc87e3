//! Drip scheduler: periodic worker that advances due sequence runs.
//!
//! Wires the in-memory store and activity feed to a logging dispatcher and
//! ticks the scheduler on a fixed interval until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use drip_core::config::AppConfig;
use drip_sequence::{InMemoryActivityFeed, InMemorySequenceStore, LoggingDispatcher, SequenceEngine};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "drip-scheduler")]
#[command(about = "Advances drip sequence runs on a fixed tick")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DRIP__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between ticks (overrides config)
    #[arg(long, env = "DRIP__SCHEDULER__TICK_INTERVAL_SECS")]
    tick_interval_secs: Option<u64>,

    /// Run a single tick and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Create demo templates and enrollments at startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip_scheduler=info,drip_sequence=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Drip scheduler starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.tick_interval_secs {
        config.scheduler.tick_interval_secs = secs;
    }
    if cli.seed_demo {
        config.seed_demo = true;
    }

    info!(
        node_id = %config.node_id,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        batch_size = config.scheduler.batch_size,
        worker_concurrency = config.scheduler.worker_concurrency,
        max_dispatch_attempts = config.retry.max_dispatch_attempts,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(port = config.metrics.port, "Metrics exporter started");
    }

    let engine = SequenceEngine::new(
        &config,
        Arc::new(InMemorySequenceStore::new()),
        Arc::new(InMemoryActivityFeed::new()),
        Arc::new(LoggingDispatcher),
    )
    .with_event_sink(drip_core::event_bus::log_sink());

    if config.seed_demo {
        engine.seed_demo(Utc::now()).await?;
    }

    if cli.once {
        let report = engine.tick(Utc::now()).await?;
        info!(?report, "Single tick finished");
        return Ok(());
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        config.scheduler.tick_interval_secs.max(1),
    ));
    info!("Drip scheduler is ready");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.tick(Utc::now()).await {
                    Ok(report) if report.halted => {
                        warn!(?report, "Tick halted on store error, retrying next interval");
                    }
                    Ok(report) => info!(?report, "Tick finished"),
                    Err(e) => error!(error = %e, "Tick failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Drip scheduler stopped");
    Ok(())
}
