//! Error types for store operations

use thiserror::Error;

/// Domain errors surfaced by the entity store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("entity {0:?} already exists")]
    AlreadyExists(String),

    #[error("entity {0:?} not found")]
    NotFound(String),

    #[error("invalid entity: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
