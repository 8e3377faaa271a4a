//! Lattice-Lab RPC server
//!
//! tonic implementation of `EntityStoreService` over a local
//! [`EntityStore`], with an optional seam for hosting the approval gate on
//! the same server.

mod approval;
mod server;
mod store_service;

pub use approval::{ApprovalControl, ApprovalError};
pub use server::RpcServer;
pub use store_service::StoreServiceImpl;

use lattice_lab_store::StoreError;
use tonic::Status;

/// Map store errors onto canonical gRPC status codes.
pub(crate) fn status_from_store(err: StoreError) -> Status {
    match &err {
        StoreError::AlreadyExists(_) => Status::already_exists(err.to_string()),
        StoreError::NotFound(_) => Status::not_found(err.to_string()),
        StoreError::Invalid(_) => Status::invalid_argument(err.to_string()),
    }
}
