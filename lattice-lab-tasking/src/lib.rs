//! Lattice-Lab task manager
//!
//! Watches classified tracks and assigns tasks by threat level. High-threat
//! intercept assignments go through a human-approval gate: the entity sits
//! in PENDING_APPROVAL behind a cancellable timer until an operator
//! approves (→ INTERCEPT, task catalog written), denies, or the timer
//! auto-denies (→ IDLE).

mod manager;
mod rules;

pub use manager::{Assignment, TaskConfig, TaskError, TaskManager};
pub use rules::{rules, TaskState};
