//! Domain consumers of the Lattice-Lab core.
//!
//! Everything here talks to an entity store over its RPC surface: the
//! simulators produce tracks, the classifier tags threat levels by speed,
//! and the fusion service correlates same-object tracks from different
//! sensors. None of these know anything about replication; the mesh keeps
//! stores convergent underneath them.

pub mod classifier;
pub mod fusion;
pub mod radar;
pub mod sensor;

mod runtime;

pub use runtime::ServiceError;
pub(crate) use runtime::{connect, StoreClient};
