//! Classifier against a live in-process store: velocity in, threat out.

use lattice_lab_proto::{
    keys, ClassificationComponent, ComponentPayload, CreateEntityRequest, Entity,
    EntityStoreServiceClient, EntityType, GetEntityRequest, ThreatLevel, VelocityComponent,
};
use lattice_lab_rpc::RpcServer;
use lattice_lab_services::classifier::{Classifier, ClassifierConfig};
use lattice_lab_store::EntityStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint};

async fn start_store_server() -> (String, broadcast::Sender<()>) {
    let store = Arc::new(EntityStore::builder().node_id("store-node").build());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = RpcServer::new(store)
            .serve_with_incoming(TcpListenerStream::new(listener), shutdown_rx)
            .await;
    });
    (addr, shutdown_tx)
}

fn connect(addr: &str) -> EntityStoreServiceClient<Channel> {
    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .expect("endpoint")
        .connect_lazy();
    EntityStoreServiceClient::new(channel)
}

#[tokio::test]
async fn fast_track_gets_high_threat() {
    let (addr, _server) = start_store_server().await;

    let classifier = Classifier::new(ClassifierConfig {
        store_addr: addr.clone(),
    });
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _keepalive = shutdown_tx;
        let _ = classifier.run(shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = connect(&addr);
    let mut entity = Entity {
        id: "fast-1".into(),
        r#type: EntityType::Track as i32,
        ..Default::default()
    };
    entity.components.insert(
        keys::VELOCITY.into(),
        VelocityComponent {
            speed: 480.0,
            heading: 90.0,
        }
        .to_any(),
    );
    client
        .create_entity(CreateEntityRequest {
            entity: Some(entity),
        })
        .await
        .expect("create");

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let got = client
            .get_entity(GetEntityRequest { id: "fast-1".into() })
            .await
            .expect("get")
            .into_inner();
        if got.components.contains_key(keys::THREAT) {
            assert_eq!(lattice_lab_proto::threat_level(&got), ThreatLevel::High);
            let classification =
                ClassificationComponent::from_any(&got.components[keys::CLASSIFICATION])
                    .expect("classification");
            assert_eq!(classification.label, "military");
            // The velocity the sensor wrote survives the merge.
            assert!(got.components.contains_key(keys::VELOCITY));
            return;
        }
        assert!(Instant::now() < deadline, "track was never classified");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
