//! Lattice-Lab mesh replication
//!
//! Keeps peer entity stores convergent with the local store: watches the
//! local event stream, suppresses echoes, prioritizes and coalesces bursts,
//! enforces a byte budget, and merges state into each peer. Also home of
//! the controllable listener used to test partition tolerance.

pub mod budget;
pub mod partition;
mod relay;

pub use budget::{event_priority, Coalescer, Priority, TokenBucket};
pub use partition::{ControllableListener, PartitionGate, PartitionedIo};
pub use relay::{Relay, RelayConfig, RelayError, RelayStats};
