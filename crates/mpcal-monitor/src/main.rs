//! mpcal-monitor - standalone node-liveness monitor.
//!
//! Runs the monitor service as its own process so that failure-detector
//! clients on any node can ask "is peer X alive?". Archetype processes
//! register and heartbeat against this address; the monitor may be
//! restarted freely, since clients re-register lazily.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mpcal_runtime::monitor::{Monitor, MonitorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// mpcal-monitor - node-liveness monitor for MPCal deployments
#[derive(Parser, Debug)]
#[command(name = "mpcal-monitor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Heartbeat silence tolerated before a peer is suspected
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    window: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let monitor = Arc::new(
        Monitor::bind(&args.listen, MonitorConfig {
            window: args.window,
        })
        .await
        .context("failed to bind monitor listener")?,
    );
    info!(addr = %monitor.local_addr(), window = ?args.window, "monitor running");

    let server = Arc::clone(&monitor);
    let mut serve_task = tokio::spawn(async move { server.serve().await });

    tokio::select! {
        joined = &mut serve_task => {
            joined.context("monitor task failed")??;
        },
        _ = tokio::signal::ctrl_c() => {
            info!("signal received; shutting down");
            monitor.close();
            serve_task.await.context("monitor task failed")??;
        },
    }

    Ok(())
}
