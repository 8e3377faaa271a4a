//! Seam between the RPC surface and the approval gate.

use lattice_lab_proto::Entity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApprovalError {
    /// No pending approval exists for this entity.
    #[error("no pending approval for entity {0:?}")]
    NoPending(String),

    #[error("store error: {0}")]
    Store(String),
}

/// Control-plane operations of the approval gate, hostable by the store's
/// RPC server. `NoPending` maps to FAILED_PRECONDITION on the wire.
#[async_trait::async_trait]
pub trait ApprovalControl: Send + Sync {
    async fn approve(&self, entity_id: &str) -> Result<Entity, ApprovalError>;
    async fn deny(&self, entity_id: &str) -> Result<Entity, ApprovalError>;
}
