//! Task manager daemon: watches a store for classified tracks and manages
//! task assignments behind the approval gate.

use clap::Parser;
use lattice_lab_tasking::{TaskConfig, TaskManager};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "task-manager", version, about = "Lattice-Lab task manager")]
struct Args {
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = TaskConfig::default();
    if let Ok(addr) = std::env::var("STORE_ADDR") {
        cfg.store_addr = addr;
    }
    if let Ok(timeout) = std::env::var("APPROVAL_TIMEOUT") {
        let secs: u64 = timeout
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid APPROVAL_TIMEOUT {timeout:?}"))?;
        cfg.approval_timeout = Duration::from_secs(secs);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let manager = TaskManager::new(cfg);
    manager.run(shutdown_rx).await?;
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

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("listen for ctrl-c");
    }
}
