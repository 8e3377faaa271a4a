//! Bandwidth budgeting: event priorities, a byte-based token bucket, and a
//! coalescer that keeps only the latest non-delete event per entity.

use lattice_lab_proto::{threat_level, EntityEvent, EventType, ThreatLevel};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Relay priority of an event. Deletes outrank everything; otherwise the
/// threat component decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Delete = 4,
}

/// Priority of an entity event based on its type and threat component.
pub fn event_priority(event: &EntityEvent) -> Priority {
    if event.r#type() == EventType::Deleted {
        return Priority::Delete;
    }
    let Some(entity) = event.entity.as_ref() else {
        return Priority::None;
    };
    match threat_level(entity) {
        ThreatLevel::High => Priority::High,
        ThreatLevel::Medium => Priority::Medium,
        ThreatLevel::Low => Priority::Low,
        _ => Priority::None,
    }
}

/// Token-bucket rate limiter measured in bytes.
///
/// Refills off a monotonic clock, so wall-clock skew can never drain or
/// overfill the bucket.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    max_tokens: f64,
    rate: f64, // bytes per second
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// A bucket that refills at `bytes_per_sec` and holds at most
    /// `burst_bytes`.
    pub fn new(bytes_per_sec: f64, burst_bytes: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: burst_bytes,
                last: Instant::now(),
            }),
            max_tokens: burst_bytes,
            rate: bytes_per_sec,
        }
    }

    /// Whether `bytes` may be spent now. HIGH and DELETE priorities bypass
    /// the budget entirely.
    pub fn allow(&self, bytes: usize, priority: Priority) -> bool {
        if priority >= Priority::High {
            return true;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.max_tokens);
        state.last = now;

        let cost = bytes as f64;
        if cost > state.tokens {
            return false;
        }
        state.tokens -= cost;
        true
    }
}

/// Queue that deduplicates entity events, keeping only the latest non-delete
/// event per entity id. Delete events are never coalesced away.
#[derive(Default)]
pub struct Coalescer {
    state: Mutex<CoalescerState>,
}

#[derive(Default)]
struct CoalescerState {
    events: HashMap<String, EntityEvent>,
    order: Vec<String>, // insertion order for fairness
    deletes: Vec<EntityEvent>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. A newer non-delete event replaces an older one for
    /// the same entity id.
    pub fn add(&self, event: EntityEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if event.r#type() == EventType::Deleted {
            state.deletes.push(event);
            return;
        }

        let id = event
            .entity
            .as_ref()
            .map(|e| e.id.clone())
            .unwrap_or_default();
        if !state.events.contains_key(&id) {
            state.order.push(id.clone());
        }
        state.events.insert(id, event);
    }

    /// Take all queued events, highest priority first, and clear the queue.
    /// Ties keep insertion order (non-deletes before deletes).
    pub fn drain(&self) -> Vec<EntityEvent> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut result = Vec::with_capacity(state.events.len() + state.deletes.len());
        let order = std::mem::take(&mut state.order);
        let mut events = std::mem::take(&mut state.events);
        for id in order {
            if let Some(event) = events.remove(&id) {
                result.push(event);
            }
        }
        result.append(&mut state.deletes);

        result.sort_by(|a, b| event_priority(b).cmp(&event_priority(a)));
        result
    }
}
