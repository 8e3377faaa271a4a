//! Lattice-Lab Daemon (`lattice-labd`)
//!
//! Hosts one node of the fabric: the entity store and its RPC surface, the
//! TTL reaper, and, when peers are configured, the mesh relay that keeps
//! this node convergent with the rest of the mesh.
//!
//! Configuration comes from the environment: `PORT`, `NODE_ID`,
//! `MESH_PEERS` (comma-separated), `MESH_BANDWIDTH_BPS`, `MESH_BURST_BYTES`.

use clap::Parser;
use lattice_lab_mesh::{Relay, RelayConfig};
use lattice_lab_rpc::RpcServer;
use lattice_lab_store::EntityStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lattice-labd", version, about = "Lattice-Lab node daemon")]
struct Args {
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let port: u16 = match std::env::var("PORT") {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid PORT {value:?}"))?,
        Err(_) => 50051,
    };
    let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("node-{}", &suffix[..8])
    });

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %node_id,
        "lattice-labd starting"
    );

    let store = Arc::new(EntityStore::builder().node_id(node_id.clone()).build());
    let (shutdown_tx, _) = broadcast::channel(1);

    // TTL reaper.
    tokio::spawn({
        let store = store.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            store.run_reaper(Duration::from_secs(1), shutdown_rx).await;
        }
    });

    // Embedded mesh relay when peers are configured.
    let peers: Vec<String> = std::env::var("MESH_PEERS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();
    if !peers.is_empty() {
        let relay_cfg = RelayConfig {
            local_addr: format!("127.0.0.1:{port}"),
            peers,
            // Distinct origin identity: tagging the relay with the store's
            // node id would suppress this node's own writes.
            node_id: format!("{node_id}-relay"),
            bandwidth_bps: env_u64("MESH_BANDWIDTH_BPS")?,
            burst_bytes: env_u64("MESH_BURST_BYTES")?,
        };
        tokio::spawn(supervise_relay(relay_cfg, shutdown_tx.clone()));
    }

    // Shutdown on SIGINT/SIGTERM.
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    RpcServer::new(store)
        .serve(addr, shutdown_tx.subscribe())
        .await?;

    tracing::info!("daemon stopped");
    Ok(())
}

/// Run the relay, restarting it if the local watch stream dies while the
/// daemon is still up.
async fn supervise_relay(cfg: RelayConfig, shutdown_tx: broadcast::Sender<()>) {
    loop {
        let relay = Relay::new(cfg.clone());
        match relay.run(shutdown_tx.subscribe()).await {
            Ok(()) => return,
            Err(e) => {
                let mut shutdown_rx = shutdown_tx.subscribe();
                tracing::warn!(error = %e, "mesh relay died, restarting in 1s");
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

fn env_u64(name: &str) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {name} {value:?}")),
        Err(_) => Ok(0),
    }
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
