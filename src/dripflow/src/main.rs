//! DripFlow — drip campaign enrollment & touch scheduling engine.
//!
//! Main entry point: loads configuration, wires channel senders, and runs
//! the scheduler and staleness sweeps on background intervals.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing::info;

use drip_core::config::AppConfig;
use drip_delivery::SimulatedSender;
use drip_engine::DripEngine;

#[derive(Parser, Debug)]
#[command(name = "dripflow")]
#[command(about = "Drip campaign enrollment and touch scheduling engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DRIPFLOW__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between scheduler passes (overrides config)
    #[arg(long, env = "DRIPFLOW__SCHEDULER__PASS_INTERVAL_SECS")]
    pass_interval: Option<u64>,

    /// Run a single scheduler pass and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dripflow=info,drip_delivery=info,drip_ingest=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("DripFlow starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.pass_interval {
        config.scheduler.pass_interval_secs = interval;
    }

    info!(
        node_id = %config.node_id,
        pass_interval_secs = config.scheduler.pass_interval_secs,
        lease_secs = config.scheduler.lease_secs,
        "Configuration loaded"
    );

    let pass_interval_secs = config.scheduler.pass_interval_secs;
    let engine = Arc::new(DripEngine::new(config));

    // Simulated providers until real carrier integrations are wired in.
    engine.senders().register(Arc::new(SimulatedSender::sms()));
    engine.senders().register(Arc::new(SimulatedSender::email()));
    engine.senders().register(Arc::new(SimulatedSender::direct_mail()));
    engine.senders().register(Arc::new(SimulatedSender::social_dm()));
    engine.senders().register(Arc::new(SimulatedSender::phone_reminder()));

    if cli.once {
        let summary = engine.tick(Utc::now());
        info!(
            dispatched = summary.dispatched,
            sent = summary.sent,
            failed = summary.failed,
            "Single scheduler pass complete"
        );
        return Ok(());
    }

    // Scheduler loop
    let scheduler_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(pass_interval_secs));
        loop {
            interval.tick().await;
            let summary = scheduler_engine.tick(Utc::now());
            if summary.dispatched > 0 {
                info!(
                    dispatched = summary.dispatched,
                    sent = summary.sent,
                    retrying = summary.retrying,
                    failed = summary.failed,
                    bounced = summary.bounced,
                    "Scheduler pass complete"
                );
            }
        }
    });

    // Staleness sweep
    let sweep_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            sweep_engine.expire_stale(Utc::now());
        }
    });

    info!("DripFlow is scheduling touches");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    Ok(())
}
