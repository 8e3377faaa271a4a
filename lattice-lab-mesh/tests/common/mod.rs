//! Shared helpers for mesh integration tests: in-process store servers,
//! all-to-all clusters with partitionable listeners, and the convergence
//! oracle.

#![allow(dead_code)]

use lattice_lab_mesh::{ControllableListener, PartitionGate, Relay, RelayConfig};
use lattice_lab_proto::{
    keys, ComponentPayload, CreateEntityRequest, Entity, EntityStoreServiceClient, EntityType,
    GetEntityRequest, ThreatComponent, ThreatLevel, UpdateEntityRequest,
};
use lattice_lab_rpc::RpcServer;
use lattice_lab_store::EntityStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint};

pub type StoreClient = EntityStoreServiceClient<Channel>;

/// Start a plain (non-partitionable) store server on an ephemeral port.
pub async fn start_store_server(node_id: &str) -> (Arc<EntityStore>, String) {
    let store = Arc::new(EntityStore::builder().node_id(node_id).build());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    // Leak the sender into the task so the server lives for the test.
    tokio::spawn({
        let store = store.clone();
        async move {
            let _keepalive = _shutdown_tx;
            let _ = RpcServer::new(store)
                .serve_with_incoming(TcpListenerStream::new(listener), shutdown_rx)
                .await;
        }
    });
    (store, addr)
}

pub fn connect(addr: &str) -> StoreClient {
    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .expect("endpoint")
        .connect_lazy();
    EntityStoreServiceClient::new(channel)
}

/// One node of a test cluster: store, partitionable server, and relay.
pub struct TestNode {
    pub store: Arc<EntityStore>,
    pub addr: String,
    pub gate: PartitionGate,
    pub relay: Arc<Relay>,
    pub relay_task: JoinHandle<()>,
    relay_cfg: RelayConfig,
    shutdown: broadcast::Sender<()>,
}

impl TestNode {
    pub fn client(&self) -> StoreClient {
        connect(&self.addr)
    }

    /// Replace a relay whose watch stream died (e.g. after a partition).
    pub fn respawn_relay(&mut self) {
        self.relay_task.abort();
        let relay = Arc::new(Relay::new(self.relay_cfg.clone()));
        self.relay = relay.clone();
        let shutdown_rx = self.shutdown.subscribe();
        self.relay_task = tokio::spawn(async move {
            let _ = relay.run(shutdown_rx).await;
        });
    }
}

/// Spin up an n-node mesh: one store + partitionable server + all-to-all
/// relay per node.
pub async fn start_cluster(n: usize) -> Vec<TestNode> {
    let mut stores = Vec::new();
    for i in 0..n {
        let store = Arc::new(
            EntityStore::builder()
                .node_id(format!("node-{i}"))
                .build(),
        );
        let listener = ControllableListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let gate = listener.gate();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn({
            let store = store.clone();
            async move {
                let _ = RpcServer::new(store)
                    .serve_with_incoming(listener.into_incoming(), shutdown_rx)
                    .await;
            }
        });

        stores.push((store, addr, gate, shutdown_tx));
    }

    let addrs: Vec<String> = stores.iter().map(|(_, addr, _, _)| addr.clone()).collect();

    let mut nodes = Vec::new();
    for (i, (store, addr, gate, shutdown)) in stores.into_iter().enumerate() {
        let peers: Vec<String> = addrs
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, a)| a.clone())
            .collect();
        let relay_cfg = RelayConfig {
            local_addr: addr.clone(),
            peers,
            // The relay's own origin identity; distinct from the store's
            // node id so local writes are forwarded.
            node_id: format!("node-{i}-relay"),
            bandwidth_bps: 0,
            burst_bytes: 0,
        };
        let relay = Arc::new(Relay::new(relay_cfg.clone()));
        let relay_task = tokio::spawn({
            let relay = relay.clone();
            let shutdown_rx = shutdown.subscribe();
            async move {
                let _ = relay.run(shutdown_rx).await;
            }
        });

        nodes.push(TestNode {
            store,
            addr,
            gate,
            relay,
            relay_task,
            relay_cfg,
            shutdown,
        });
    }

    // Let relays establish their watch streams before tests proceed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    nodes
}

pub fn track(id: &str) -> Entity {
    Entity {
        id: id.into(),
        r#type: EntityType::Track as i32,
        ..Default::default()
    }
}

pub async fn create_track(client: &mut StoreClient, id: &str) {
    client
        .create_entity(CreateEntityRequest {
            entity: Some(track(id)),
        })
        .await
        .unwrap_or_else(|e| panic!("create {id}: {e}"));
}

pub fn with_threat(mut entity: Entity, level: ThreatLevel) -> Entity {
    let threat = ThreatComponent {
        level: level as i32,
    };
    entity.components.insert(keys::THREAT.into(), threat.to_any());
    entity
}

pub async fn update_threat(client: &mut StoreClient, id: &str, level: ThreatLevel) {
    client
        .update_entity(UpdateEntityRequest {
            entity: Some(with_threat(track(id), level)),
        })
        .await
        .unwrap_or_else(|e| panic!("update {id} threat {level}: {e}"));
}

pub async fn entity_exists(client: &mut StoreClient, id: &str) -> bool {
    client
        .get_entity(GetEntityRequest { id: id.into() })
        .await
        .is_ok()
}

pub async fn wait_for_entity(client: &mut StoreClient, id: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if entity_exists(client, id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("entity {id} did not appear within {timeout:?}");
}

/// Poll until every node agrees on the entity: same threat level, and every
/// component key known anywhere is present everywhere.
pub async fn wait_for_convergence(nodes: &[TestNode], id: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let mut entities = Vec::new();
        for node in nodes {
            match node.store.get(id) {
                Ok(e) => entities.push(e),
                Err(_) => break,
            }
        }
        if entities.len() == nodes.len() && converged(&entities) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("nodes did not converge on entity {id} within {timeout:?}");
}

fn converged(entities: &[Entity]) -> bool {
    let reference = lattice_lab_proto::threat_level(&entities[0]);
    let union: BTreeSet<&String> = entities.iter().flat_map(|e| e.components.keys()).collect();
    entities.iter().all(|e| {
        lattice_lab_proto::threat_level(e) == reference
            && union.iter().all(|key| e.components.contains_key(*key))
    })
}
