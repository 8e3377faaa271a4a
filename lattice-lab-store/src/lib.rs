//! Lattice-Lab entity store
//!
//! A thread-safe, versioned map of entities. Every write is stamped with a
//! hybrid logical clock, merged per component key, and published on a watch
//! bus with slow-consumer protection. Conflict resolution lives in
//! [`merge`]: an LWW-element-map with max-wins semantics for threat.

pub mod error;
pub mod merge;
mod store;

pub use error::StoreError;
pub use merge::merge_entity;
pub use store::{EntityStore, EntityStoreBuilder, Watcher, WatcherId, DEFAULT_WATCH_BUFFER};
