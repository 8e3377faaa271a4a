//! RPC server runner with graceful shutdown

use crate::approval::ApprovalControl;
use crate::store_service::StoreServiceImpl;
use lattice_lab_proto::EntityStoreServiceServer;
use lattice_lab_store::EntityStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tonic::transport::server::{Router, Server};

/// gRPC server hosting the entity store (and, when wired, the approval
/// gate's control plane).
pub struct RpcServer {
    store: Arc<EntityStore>,
    approvals: Option<Arc<dyn ApprovalControl>>,
}

impl RpcServer {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self {
            store,
            approvals: None,
        }
    }

    /// Host the approval gate's Approve/Deny RPCs on this server.
    pub fn with_approvals(mut self, gate: Arc<dyn ApprovalControl>) -> Self {
        self.approvals = Some(gate);
        self
    }

    fn router(self) -> Router {
        let mut service = StoreServiceImpl::new(self.store);
        if let Some(gate) = self.approvals {
            service = service.with_approvals(gate);
        }
        Server::builder().add_service(EntityStoreServiceServer::new(service))
    }

    /// Serve on a TCP address until shutdown is signalled. In-flight RPCs
    /// drain before the call returns.
    pub async fn serve(
        self,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!(%addr, "entity store listening");
        self.router()
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.recv().await;
            })
            .await
    }

    /// Serve on a caller-provided connection stream. Used by the partition
    /// harness, which needs to sever and refuse connections at will.
    pub async fn serve_with_incoming<I, IO, IE>(
        self,
        incoming: I,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), tonic::transport::Error>
    where
        I: tokio_stream::Stream<Item = Result<IO, IE>>,
        IO: tonic::transport::server::Connected
            + tokio::io::AsyncRead
            + tokio::io::AsyncWrite
            + Send
            + Unpin
            + 'static,
        IO::ConnectInfo: Clone + Send + Sync + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.router()
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = shutdown.recv().await;
            })
            .await
    }
}
