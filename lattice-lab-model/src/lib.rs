//! Lattice-Lab Model
//!
//! Pure data types for the Lattice-Lab fabric, decoupled from the wire
//! format, the store, and the mesh layers.

pub mod clock;
pub mod hlc;

pub use clock::{MockClock, SystemClock, WallClock};
pub use hlc::{HlcClock, HlcTimestamp, LOGICAL_SATURATION_LIMIT};
