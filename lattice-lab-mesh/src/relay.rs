//! The mesh replication relay.
//!
//! One relay instance runs next to each store. It watches the local store's
//! event stream and pushes state into every peer, so that an all-to-all
//! mesh converges: CREATED tries a create and falls back to merge, UPDATED
//! always merges, DELETED deletes. Per-peer RPC failures are counted and
//! logged, never fatal; losing the local watch stream is fatal and bubbles
//! up to the supervisor.

use crate::budget::{event_priority, Coalescer, Priority, TokenBucket};
use futures_util::FutureExt;
use lattice_lab_proto::{
    CreateEntityRequest, DeleteEntityRequest, Entity, EntityEvent, EntityStoreServiceClient,
    EntityType, EventType, GetEntityRequest, UpdateEntityRequest, WatchEntitiesRequest,
};
use lattice_lab_store::merge_entity;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

type StoreClient = EntityStoreServiceClient<Channel>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("no peers configured")]
    NoPeers,

    #[error("invalid endpoint {addr:?}: {source}")]
    Endpoint {
        addr: String,
        source: tonic::transport::Error,
    },

    #[error("watch local store: {0}")]
    Watch(tonic::Status),

    #[error("local watch stream closed")]
    WatchClosed,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address of the local entity store (host:port).
    pub local_addr: String,
    /// Addresses of peer entity stores.
    pub peers: Vec<String>,
    /// Origin identity for echo suppression. Events tagged with this origin
    /// are this relay's own traffic coming back and are never forwarded.
    /// Must not be the local store's node id, or local writes would be
    /// suppressed too.
    pub node_id: String,
    /// Bytes per second of replication budget; 0 disables budgeting.
    pub bandwidth_bps: u64,
    /// Burst capacity of the budget in bytes.
    pub burst_bytes: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            local_addr: "127.0.0.1:50051".to_string(),
            peers: Vec::new(),
            node_id: String::new(),
            bandwidth_bps: 0,
            burst_bytes: 0,
        }
    }
}

/// Relay activity counters, readable via [`Relay::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Events successfully pushed to a peer (counted per peer).
    pub forwarded: u64,
    /// Per-peer RPC failures.
    pub errors: u64,
    /// Forwards that went through the Get+merge+Update path.
    pub merged: u64,
    /// Events rejected by the bandwidth budget.
    pub dropped: u64,
}

pub struct Relay {
    cfg: RelayConfig,
    bucket: Option<TokenBucket>,
    stats: Mutex<RelayStats>,
}

impl Relay {
    pub fn new(cfg: RelayConfig) -> Self {
        let bucket = if cfg.bandwidth_bps > 0 {
            Some(TokenBucket::new(
                cfg.bandwidth_bps as f64,
                cfg.burst_bytes.max(1) as f64,
            ))
        } else {
            None
        };
        Self {
            cfg,
            bucket,
            stats: Mutex::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> RelayStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Watch the local store and replicate events to all peers until the
    /// shutdown signal fires or the local watch stream dies.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RelayError> {
        if self.cfg.peers.is_empty() {
            return Err(RelayError::NoPeers);
        }

        // Lazy channels: a partitioned peer must not keep the relay from
        // starting, and reconnection after heal is automatic. The local
        // channel carries the long-lived watch stream, so only peer calls
        // get a per-request deadline.
        let mut local = connect(&self.cfg.local_addr, None)?;
        let mut peers = Vec::with_capacity(self.cfg.peers.len());
        for addr in &self.cfg.peers {
            peers.push((addr.clone(), connect(addr, Some(PEER_RPC_TIMEOUT))?));
        }

        let mut stream = local
            .watch_entities(WatchEntitiesRequest {
                type_filter: EntityType::Unspecified as i32,
            })
            .await
            .map_err(RelayError::Watch)?
            .into_inner();

        info!(local = %self.cfg.local_addr, peers = ?self.cfg.peers, "mesh relay running");

        let coalescer = Coalescer::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("mesh relay shutting down");
                    return Ok(());
                }
                next = stream.message() => {
                    match next {
                        Ok(Some(event)) => self.enqueue(&coalescer, event),
                        Ok(None) => return Err(RelayError::WatchClosed),
                        Err(status) => return Err(RelayError::Watch(status)),
                    }

                    // Greedily soak up whatever else is already buffered so
                    // a burst coalesces to one event per entity.
                    loop {
                        match stream.message().now_or_never() {
                            Some(Ok(Some(event))) => self.enqueue(&coalescer, event),
                            Some(Ok(None)) => return Err(RelayError::WatchClosed),
                            Some(Err(status)) => return Err(RelayError::Watch(status)),
                            None => break,
                        }
                    }

                    for event in coalescer.drain() {
                        self.budget_and_forward(&mut peers, event).await;
                    }
                }
            }
        }
    }

    fn enqueue(&self, coalescer: &Coalescer, event: EntityEvent) {
        // Echo suppression: our own traffic coming back would loop forever
        // between bidirectional peers.
        if !self.cfg.node_id.is_empty() && event.origin_node == self.cfg.node_id {
            debug!(origin = %event.origin_node, "suppressing echo");
            return;
        }
        coalescer.add(event);
    }

    async fn budget_and_forward(&self, peers: &mut [(String, StoreClient)], event: EntityEvent) {
        let priority = event_priority(&event);
        if let Some(bucket) = &self.bucket {
            let bytes = event
                .entity
                .as_ref()
                .map(prost::Message::encoded_len)
                .unwrap_or(0);
            if !bucket.allow(bytes, priority) {
                self.stats.lock().unwrap_or_else(|e| e.into_inner()).dropped += 1;
                debug!(bytes, ?priority, "bandwidth budget exhausted, dropping event");
                return;
            }
        }

        for (addr, peer) in peers.iter_mut() {
            match self.forward_event(peer, &event).await {
                Ok(()) => {
                    self.stats
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .forwarded += 1;
                }
                Err(status) => {
                    self.stats.lock().unwrap_or_else(|e| e.into_inner()).errors += 1;
                    warn!(peer = %addr, error = %status, "forward to peer failed");
                }
            }
        }
    }

    async fn forward_event(
        &self,
        peer: &mut StoreClient,
        event: &EntityEvent,
    ) -> Result<(), tonic::Status> {
        let Some(entity) = event.entity.as_ref() else {
            return Ok(());
        };
        match event.r#type() {
            EventType::Created => self.forward_create(peer, entity).await,
            EventType::Updated => self.merge_into_peer(peer, entity).await,
            EventType::Deleted => self.forward_delete(peer, &entity.id).await,
            EventType::Unspecified => Ok(()),
        }
    }

    async fn forward_create(
        &self,
        peer: &mut StoreClient,
        entity: &Entity,
    ) -> Result<(), tonic::Status> {
        match peer
            .create_entity(CreateEntityRequest {
                entity: Some(entity.clone()),
            })
            .await
        {
            Ok(_) => Ok(()),
            // Peer already has it: converge through the merge path.
            Err(status) if status.code() == Code::AlreadyExists => {
                self.merge_into_peer(peer, entity).await
            }
            Err(status) => Err(status),
        }
    }

    /// Get+merge+Update so concurrent writes on both sides converge under
    /// the CRDT laws instead of clobbering each other.
    async fn merge_into_peer(
        &self,
        peer: &mut StoreClient,
        incoming: &Entity,
    ) -> Result<(), tonic::Status> {
        let existing = match peer
            .get_entity(GetEntityRequest {
                id: incoming.id.clone(),
            })
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::NotFound => {
                peer.create_entity(CreateEntityRequest {
                    entity: Some(incoming.clone()),
                })
                .await?;
                return Ok(());
            }
            Err(status) => return Err(status),
        };

        let mut merged = merge_entity(&existing, incoming);
        if merged.created_at.is_none() {
            merged.created_at = existing.created_at;
        }

        peer.update_entity(UpdateEntityRequest {
            entity: Some(merged),
        })
        .await?;
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).merged += 1;
        Ok(())
    }

    async fn forward_delete(
        &self,
        peer: &mut StoreClient,
        id: &str,
    ) -> Result<(), tonic::Status> {
        match peer
            .delete_entity(DeleteEntityRequest { id: id.to_string() })
            .await
        {
            Ok(_) => Ok(()),
            // Already gone on the peer.
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status),
        }
    }
}

const PEER_RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

fn connect(addr: &str, timeout: Option<std::time::Duration>) -> Result<StoreClient, RelayError> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let mut endpoint = Endpoint::from_shared(uri).map_err(|source| RelayError::Endpoint {
        addr: addr.to_string(),
        source,
    })?;
    if let Some(timeout) = timeout {
        endpoint = endpoint.timeout(timeout).connect_timeout(timeout);
    }
    Ok(EntityStoreServiceClient::new(endpoint.connect_lazy()))
}
