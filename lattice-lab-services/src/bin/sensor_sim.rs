//! EO sensor simulator daemon.

use clap::Parser;
use lattice_lab_services::sensor::{SensorConfig, Simulator};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sensor-sim", version, about = "Lattice-Lab EO sensor simulator")]
struct Args {
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = SensorConfig::default();
    if let Ok(addr) = std::env::var("STORE_ADDR") {
        cfg.store_addr = addr;
    }
    if let Ok(interval) = std::env::var("INTERVAL") {
        let secs: u64 = interval
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid INTERVAL {interval:?}"))?;
        cfg.interval = Duration::from_secs(secs);
    }
    if let Ok(n) = std::env::var("NUM_TRACKS") {
        cfg.num_tracks = n
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid NUM_TRACKS {n:?}"))?;
    }
    if let Ok(id) = std::env::var("SENSOR_ID") {
        cfg.sensor_id = id;
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(());
    });

    Simulator::new(cfg).run(shutdown_rx).await?;
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse().expect("static directive"));
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
