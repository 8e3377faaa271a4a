//! Hybrid Logical Clock (HLC)
//!
//! HLCs combine wall clock time with a logical counter and a node id to
//! provide a total order over events across nodes, even with clock drift.

use crate::clock::{SystemClock, WallClock};
use std::cmp::Ordering;
use std::sync::Mutex;

/// Logical counters past this point indicate a wedged wall clock. The clock
/// fails fast rather than reuse or wrap timestamps.
pub const LOGICAL_SATURATION_LIMIT: u32 = u32::MAX - (1 << 16);

/// A hybrid logical clock timestamp.
///
/// Total order: physical time first, then the logical counter, then the
/// node id as the final tie-breaker. The zero value is the minimum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HlcTimestamp {
    /// Wall clock time in nanoseconds since Unix epoch
    pub physical: u64,
    /// Logical counter for ordering events at the same physical time
    pub logical: u32,
    /// Node id for tie-breaking
    pub node: String,
}

impl HlcTimestamp {
    pub fn new(physical: u64, logical: u32, node: impl Into<String>) -> Self {
        Self {
            physical,
            logical,
            node: node.into(),
        }
    }

    /// True for the zero timestamp, the minimum of the total order.
    pub fn is_zero(&self) -> bool {
        self.physical == 0 && self.logical == 0 && self.node.is_empty()
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical
            .cmp(&other.physical)
            .then_with(|| self.logical.cmp(&other.logical))
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}@{}", self.physical, self.logical, self.node)
    }
}

/// A hybrid logical clock bound to a specific node.
///
/// `now` and `update` are O(1) and hold a single internal mutex.
pub struct HlcClock {
    node: String,
    wall: Box<dyn WallClock>,
    state: Mutex<ClockState>,
}

#[derive(Default)]
struct ClockState {
    last_physical: u64,
    last_logical: u32,
}

impl HlcClock {
    /// Create a clock for the given node id backed by the system clock.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_wall_clock(node_id, SystemClock)
    }

    /// Create a clock with an explicit wall-clock source (for testing).
    pub fn with_wall_clock(node_id: impl Into<String>, wall: impl WallClock + 'static) -> Self {
        Self {
            node: node_id.into(),
            wall: Box::new(wall),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// The node id this clock stamps timestamps with.
    pub fn node_id(&self) -> &str {
        &self.node
    }

    /// Generate a new timestamp strictly greater than any previously
    /// generated or observed by this clock.
    pub fn now(&self) -> HlcTimestamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let wall = self.wall.now_ns();
        if wall > state.last_physical {
            state.last_physical = wall;
            state.last_logical = 0;
        } else {
            state.last_logical = self.bump(state.last_logical);
        }

        self.stamp(&state)
    }

    /// Absorb a remote timestamp, producing a new timestamp greater than
    /// both the local state and the remote.
    pub fn update(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let wall = self.wall.now_ns();
        let max_phys = wall.max(state.last_physical).max(remote.physical);

        if max_phys == state.last_physical && max_phys == remote.physical {
            // All candidates tied. Advance past the larger logical.
            let base = state.last_logical.max(remote.logical);
            state.last_logical = self.bump(base);
        } else if max_phys == state.last_physical {
            state.last_logical = self.bump(state.last_logical);
        } else if max_phys == remote.physical {
            state.last_logical = self.bump(remote.logical);
        } else {
            state.last_logical = 0;
        }
        state.last_physical = max_phys;

        self.stamp(&state)
    }

    fn stamp(&self, state: &ClockState) -> HlcTimestamp {
        HlcTimestamp {
            physical: state.last_physical,
            logical: state.last_logical,
            node: self.node.clone(),
        }
    }

    fn bump(&self, logical: u32) -> u32 {
        if logical >= LOGICAL_SATURATION_LIMIT {
            panic!(
                "hlc logical counter saturated on node {:?} (wall clock wedged?)",
                self.node
            );
        }
        logical + 1
    }

    #[cfg(test)]
    fn seed_state(&self, physical: u64, logical: u32) {
        let mut state = self.state.lock().unwrap();
        state.last_physical = physical;
        state.last_logical = logical;
    }
}

impl std::fmt::Debug for HlcClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlcClock")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}
