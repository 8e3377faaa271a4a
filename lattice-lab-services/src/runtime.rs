//! Shared plumbing for services: store client construction and errors.

use lattice_lab_proto::EntityStoreServiceClient;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

pub type StoreClient = EntityStoreServiceClient<Channel>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid store address {0:?}")]
    Endpoint(String),

    #[error("store rpc: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("watch stream closed")]
    WatchClosed,
}

pub fn connect(addr: &str) -> Result<StoreClient, ServiceError> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|_| ServiceError::Endpoint(addr.to_string()))?;
    Ok(EntityStoreServiceClient::new(endpoint.connect_lazy()))
}
