//! Relay behavior against live in-process store servers: forwarding paths,
//! echo suppression, merge-on-conflict, and the bandwidth budget.

mod common;

use common::*;
use lattice_lab_mesh::{Relay, RelayConfig, RelayError};
use lattice_lab_proto::{
    keys, ComponentPayload, CreateEntityRequest, DeleteEntityRequest, GetEntityRequest,
    PositionComponent, ThreatLevel, UpdateEntityRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn spawn_relay(cfg: RelayConfig) -> (Arc<Relay>, broadcast::Sender<()>) {
    let relay = Arc::new(Relay::new(cfg));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn({
        let relay = relay.clone();
        async move {
            let _ = relay.run(shutdown_rx).await;
        }
    });
    (relay, shutdown_tx)
}

#[tokio::test]
async fn no_peers_is_an_error() {
    let relay = Relay::new(RelayConfig::default());
    let (_tx, rx) = broadcast::channel(1);
    assert!(matches!(relay.run(rx).await, Err(RelayError::NoPeers)));
}

#[tokio::test]
async fn forwards_create_to_peer() {
    let (_local_store, local_addr) = start_store_server("local").await;
    let (_peer_store, peer_addr) = start_store_server("peer").await;

    let (relay, _shutdown) = spawn_relay(RelayConfig {
        local_addr: local_addr.clone(),
        peers: vec![peer_addr.clone()],
        node_id: "relay-a".into(),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut local = connect(&local_addr);
    create_track(&mut local, "mesh-test-1").await;

    let mut peer = connect(&peer_addr);
    wait_for_entity(&mut peer, "mesh-test-1", Duration::from_secs(5)).await;

    let got = peer
        .get_entity(GetEntityRequest {
            id: "mesh-test-1".into(),
        })
        .await
        .expect("get on peer")
        .into_inner();
    assert_eq!(got.id, "mesh-test-1");
    assert!(relay.stats().forwarded >= 1);
}

#[tokio::test]
async fn forwards_delete_and_ignores_missing() {
    let (_local_store, local_addr) = start_store_server("local").await;
    let (_peer_store, peer_addr) = start_store_server("peer").await;

    let (_relay, _shutdown) = spawn_relay(RelayConfig {
        local_addr: local_addr.clone(),
        peers: vec![peer_addr.clone()],
        node_id: "relay-a".into(),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut local = connect(&local_addr);
    let mut peer = connect(&peer_addr);

    create_track(&mut local, "mesh-del-1").await;
    wait_for_entity(&mut peer, "mesh-del-1", Duration::from_secs(5)).await;

    local
        .delete_entity(DeleteEntityRequest {
            id: "mesh-del-1".into(),
        })
        .await
        .expect("delete on local");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !entity_exists(&mut peer, "mesh-del-1").await {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "delete did not replicate"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn echo_suppression_drops_own_origin() {
    // A relay configured with the local store's own node id sees every
    // local event as its own echo: nothing may reach the peer.
    let (_local_store, local_addr) = start_store_server("node-a").await;
    let (_peer_store, peer_addr) = start_store_server("peer").await;

    let (relay, _shutdown) = spawn_relay(RelayConfig {
        local_addr: local_addr.clone(),
        peers: vec![peer_addr.clone()],
        node_id: "node-a".into(),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut local = connect(&local_addr);
    create_track(&mut local, "echo-test-1").await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut peer = connect(&peer_addr);
    assert!(!entity_exists(&mut peer, "echo-test-1").await);
    assert_eq!(relay.stats().forwarded, 0);
}

#[tokio::test]
async fn merge_on_conflict_keeps_max_threat() {
    // Peer already knows the entity as HIGH threat; the local store later
    // learns it as LOW with a newer stamp and a position. After relaying,
    // the peer must hold HIGH (max-wins) plus the position (LWW union).
    let (_local_store, local_addr) = start_store_server("node-local").await;
    let (_peer_store, peer_addr) = start_store_server("node-peer").await;

    let mut peer = connect(&peer_addr);
    peer.create_entity(CreateEntityRequest {
        entity: Some(with_threat(track("merge-test-1"), ThreatLevel::High)),
    })
    .await
    .expect("create on peer");

    let (relay, _shutdown) = spawn_relay(RelayConfig {
        local_addr: local_addr.clone(),
        peers: vec![peer_addr.clone()],
        node_id: "relay-a".into(),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut local = connect(&local_addr);
    let mut entity = with_threat(track("merge-test-1"), ThreatLevel::Low);
    let pos = PositionComponent {
        lat: 10.0,
        lon: 20.0,
        alt: 0.0,
    };
    entity.components.insert(keys::POSITION.into(), pos.to_any());
    local
        .create_entity(CreateEntityRequest {
            entity: Some(entity),
        })
        .await
        .expect("create on local");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let got = peer
            .get_entity(GetEntityRequest {
                id: "merge-test-1".into(),
            })
            .await
            .expect("get merged")
            .into_inner();
        if got.components.contains_key(keys::POSITION) {
            assert_eq!(
                lattice_lab_proto::threat_level(&got),
                ThreatLevel::High,
                "max-wins must keep HIGH"
            );
            break;
        }
        assert!(std::time::Instant::now() < deadline, "merge did not happen");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(relay.stats().merged >= 1);
}

#[tokio::test]
async fn budget_drops_low_priority_but_passes_high() {
    let (_local_store, local_addr) = start_store_server("node-local").await;
    let (_peer_store, peer_addr) = start_store_server("node-peer").await;

    // A budget far too small for any entity: every NONE-priority event is
    // dropped, HIGH-threat events bypass.
    let (relay, _shutdown) = spawn_relay(RelayConfig {
        local_addr: local_addr.clone(),
        peers: vec![peer_addr.clone()],
        node_id: "relay-a".into(),
        bandwidth_bps: 1,
        burst_bytes: 1,
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut local = connect(&local_addr);
    create_track(&mut local, "budget-1").await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut peer = connect(&peer_addr);
    assert!(!entity_exists(&mut peer, "budget-1").await);
    assert!(relay.stats().dropped >= 1);

    // The HIGH-threat update must go through on an exhausted bucket.
    local
        .update_entity(UpdateEntityRequest {
            entity: Some(with_threat(track("budget-1"), ThreatLevel::High)),
        })
        .await
        .expect("high update");

    wait_for_entity(&mut peer, "budget-1", Duration::from_secs(5)).await;
    let got = peer
        .get_entity(GetEntityRequest {
            id: "budget-1".into(),
        })
        .await
        .expect("get")
        .into_inner();
    assert_eq!(lattice_lab_proto::threat_level(&got), ThreatLevel::High);
}

#[tokio::test]
async fn bidirectional_relays_converge() {
    let (_store_1, addr_1) = start_store_server("node-1").await;
    let (_store_2, addr_2) = start_store_server("node-2").await;

    let (_relay_1, _shutdown_1) = spawn_relay(RelayConfig {
        local_addr: addr_1.clone(),
        peers: vec![addr_2.clone()],
        node_id: "node-1-relay".into(),
        ..Default::default()
    });
    let (_relay_2, _shutdown_2) = spawn_relay(RelayConfig {
        local_addr: addr_2.clone(),
        peers: vec![addr_1.clone()],
        node_id: "node-2-relay".into(),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client_1 = connect(&addr_1);
    let mut client_2 = connect(&addr_2);

    create_track(&mut client_1, "bidir-1").await;
    create_track(&mut client_2, "bidir-2").await;

    wait_for_entity(&mut client_2, "bidir-1", Duration::from_secs(5)).await;
    wait_for_entity(&mut client_1, "bidir-2", Duration::from_secs(5)).await;
}
