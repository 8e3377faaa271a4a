//! CRDT merge for entities.
//!
//! An LWW-element-map: for each component key the side whose entity-level
//! stamp is greater wins, except `threat`, where the greater threat level
//! wins and the stamp only breaks ties. The merge is commutative,
//! associative and idempotent on the resulting key set and winners.

use lattice_lab_model::HlcTimestamp;
use lattice_lab_proto::{entity_hlc, keys, ComponentPayload, Entity, ThreatComponent};
use prost_types::{Any, Timestamp};

/// Merge two entities with the same id into one.
///
/// The result carries the greater entity-level stamp, the union of component
/// keys with per-key winners, and the earliest known `created_at`.
pub fn merge_entity(a: &Entity, b: &Entity) -> Entity {
    let hlc_a = entity_hlc(a);
    let hlc_b = entity_hlc(b);

    // Entity-level fields come from the side with the greater stamp; ties
    // go to b, which is deterministic because the stamp includes the node.
    let (win, win_hlc) = if hlc_a > hlc_b {
        (a, &hlc_a)
    } else {
        (b, &hlc_b)
    };

    let mut merged = Entity {
        id: a.id.clone(),
        r#type: win.r#type,
        components: Default::default(),
        created_at: min_created_at(a.created_at.as_ref(), b.created_at.as_ref()),
        updated_at: win.updated_at,
        hlc_physical: win_hlc.physical,
        hlc_logical: win_hlc.logical,
        hlc_node: win_hlc.node.clone(),
    };

    for key in a.components.keys().chain(b.components.keys()) {
        if merged.components.contains_key(key) {
            continue;
        }
        let value = match (a.components.get(key), b.components.get(key)) {
            (Some(va), None) => va.clone(),
            (None, Some(vb)) => vb.clone(),
            (Some(va), Some(vb)) => merge_component(key, va, vb, &hlc_a, &hlc_b),
            (None, None) => unreachable!("key came from one of the two maps"),
        };
        merged.components.insert(key.clone(), value);
    }

    merged
}

fn merge_component(
    key: &str,
    a: &Any,
    b: &Any,
    hlc_a: &HlcTimestamp,
    hlc_b: &HlcTimestamp,
) -> Any {
    match key {
        keys::THREAT => merge_threat(a, b, hlc_a, hlc_b),
        _ => {
            if hlc_a > hlc_b {
                a.clone()
            } else {
                b.clone()
            }
        }
    }
}

/// Max-wins for threat: the higher level survives a merge regardless of
/// stamp order, so a partition can never downgrade a standing threat.
fn merge_threat(a: &Any, b: &Any, hlc_a: &HlcTimestamp, hlc_b: &HlcTimestamp) -> Any {
    let Ok(threat_a) = ThreatComponent::from_any(a) else {
        return b.clone();
    };
    let Ok(threat_b) = ThreatComponent::from_any(b) else {
        return a.clone();
    };

    if threat_a.level > threat_b.level {
        return a.clone();
    }
    if threat_b.level > threat_a.level {
        return b.clone();
    }
    if hlc_a > hlc_b {
        a.clone()
    } else {
        b.clone()
    }
}

fn min_created_at(a: Option<&Timestamp>, b: Option<&Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if (a.seconds, a.nanos) <= (b.seconds, b.nanos) {
                Some(*a)
            } else {
                Some(*b)
            }
        }
        (Some(a), None) => Some(*a),
        (None, Some(b)) => Some(*b),
        (None, None) => None,
    }
}
