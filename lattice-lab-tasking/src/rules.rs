//! Threat-to-task policy.

use lattice_lab_proto::ThreatLevel;

/// Current task state for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Investigate,
    Track,
    Intercept,
    PendingApproval,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Investigate => "investigate",
            TaskState::Track => "track",
            TaskState::Intercept => "intercept",
            TaskState::PendingApproval => "pending_approval",
        };
        f.write_str(s)
    }
}

/// Map a threat level to its target state and task list. INTERCEPT is the
/// target for HIGH; whether it is reached directly or via the approval gate
/// is the manager's concern, not the policy's.
pub fn rules(threat: ThreatLevel) -> (TaskState, Vec<String>) {
    let tasks = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
    match threat {
        ThreatLevel::None => (TaskState::Idle, Vec::new()),
        ThreatLevel::Low => (TaskState::Investigate, tasks(&["monitor", "identify"])),
        ThreatLevel::Medium => (TaskState::Track, tasks(&["monitor", "identify", "track"])),
        ThreatLevel::High => (
            TaskState::Intercept,
            tasks(&["monitor", "identify", "track", "intercept"]),
        ),
        ThreatLevel::Unspecified => (TaskState::Idle, Vec::new()),
    }
}
