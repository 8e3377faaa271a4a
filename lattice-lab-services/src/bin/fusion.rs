//! Fusion daemon: correlates same-object tracks from different sensors.

use clap::Parser;
use lattice_lab_services::fusion::{FusionConfig, Fusioner};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fusion", version, about = "Lattice-Lab sensor fusion")]
struct Args {
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = FusionConfig::default();
    if let Ok(addr) = std::env::var("STORE_ADDR") {
        cfg.store_addr = addr;
    }
    if let Ok(threshold) = std::env::var("DIST_THRESHOLD") {
        cfg.dist_threshold = threshold
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid DIST_THRESHOLD {threshold:?}"))?;
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(());
    });

    Fusioner::new(cfg).run(shutdown_rx).await?;
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
