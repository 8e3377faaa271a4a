//! Generated wire types for the Lattice-Lab entity fabric, plus the small
//! amount of glue the rest of the workspace needs: HLC conversions and
//! pack/unpack helpers for the self-describing component payloads.

pub mod pb {
    tonic::include_proto!("latticelab.v1");
}

pub use pb::entity_store_service_client::EntityStoreServiceClient;
pub use pb::entity_store_service_server::{EntityStoreService, EntityStoreServiceServer};
pub use pb::{
    ApprovalComponent, ApproveActionRequest, ClassificationComponent, CreateEntityRequest,
    DeleteEntityRequest, DenyActionRequest, Entity, EntityEvent, EntityType, EventType,
    FusionComponent, GetEntityRequest, ListEntitiesRequest, ListEntitiesResponse,
    PositionComponent, SourceComponent, TaskCatalogComponent, ThreatComponent, ThreatLevel,
    UpdateEntityRequest, VelocityComponent, WatchEntitiesRequest,
};

use lattice_lab_model::HlcTimestamp;
use prost::Message;
use prost_types::Any;

/// Component keys reserved by the core. Unknown keys merge with default LWW.
pub mod keys {
    pub const POSITION: &str = "position";
    pub const VELOCITY: &str = "velocity";
    pub const CLASSIFICATION: &str = "classification";
    pub const THREAT: &str = "threat";
    pub const TASK_CATALOG: &str = "task_catalog";
    pub const SOURCE: &str = "source";
    pub const FUSION: &str = "fusion";
    pub const APPROVAL: &str = "approval";
}

const TYPE_URL_PREFIX: &str = "type.googleapis.com/latticelab.v1.";

/// A component payload that can be packed into / unpacked from an `Any`.
///
/// Implementations carry their proto type name so the blob stays
/// self-describing on the wire.
pub trait ComponentPayload: Message + Default + Sized {
    const TYPE_NAME: &'static str;

    fn to_any(&self) -> Any {
        Any {
            type_url: format!("{TYPE_URL_PREFIX}{}", Self::TYPE_NAME),
            value: self.encode_to_vec(),
        }
    }

    fn from_any(any: &Any) -> Result<Self, prost::DecodeError> {
        let expected = Self::TYPE_NAME;
        match any.type_url.rsplit('/').next() {
            Some(name) if name == format!("latticelab.v1.{expected}") => {
                Self::decode(any.value.as_slice())
            }
            _ => Err(prost::DecodeError::new(format!(
                "type url {:?} does not carry a {expected}",
                any.type_url
            ))),
        }
    }
}

macro_rules! component_payload {
    ($ty:ident) => {
        impl ComponentPayload for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);
        }
    };
}

component_payload!(PositionComponent);
component_payload!(VelocityComponent);
component_payload!(ClassificationComponent);
component_payload!(ThreatComponent);
component_payload!(TaskCatalogComponent);
component_payload!(SourceComponent);
component_payload!(FusionComponent);
component_payload!(ApprovalComponent);

/// Extract the entity-level HLC stamp.
pub fn entity_hlc(e: &Entity) -> HlcTimestamp {
    HlcTimestamp::new(e.hlc_physical, e.hlc_logical, e.hlc_node.clone())
}

/// Stamp an entity with the given HLC.
pub fn stamp_entity(e: &mut Entity, ts: &HlcTimestamp) {
    e.hlc_physical = ts.physical;
    e.hlc_logical = ts.logical;
    e.hlc_node = ts.node.clone();
}

/// Whether the entity carries any HLC stamp at all. Unstamped entities are
/// locally-originated writes; stamped ones came through replication or a
/// read-modify-write.
pub fn is_stamped(e: &Entity) -> bool {
    !entity_hlc(e).is_zero()
}

/// The threat level carried by an entity's `threat` component, or
/// `Unspecified` when the component is missing or undecodable.
pub fn threat_level(e: &Entity) -> ThreatLevel {
    let Some(any) = e.components.get(keys::THREAT) else {
        return ThreatLevel::Unspecified;
    };
    match ThreatComponent::from_any(any) {
        Ok(threat) => threat.level(),
        Err(_) => ThreatLevel::Unspecified,
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThreatLevel::Unspecified => "unspecified",
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
        };
        f.write_str(s)
    }
}
