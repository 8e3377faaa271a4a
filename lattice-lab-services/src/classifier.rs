//! Speed-based track classifier.
//!
//! Watches TRACK entities and attaches `classification` and `threat`
//! components based on speed in knots. The thresholds are demo policy, not
//! doctrine: slow is civilian, mid-range is an unknown aircraft, fast is
//! assumed military.

use crate::{connect, ServiceError, StoreClient};
use lattice_lab_proto::{
    keys, ClassificationComponent, ComponentPayload, Entity, EntityType, EventType,
    ThreatComponent, ThreatLevel, UpdateEntityRequest, VelocityComponent, WatchEntitiesRequest,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub store_addr: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:50051".to_string(),
        }
    }
}

/// Result of classifying a track.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: &'static str,
    pub confidence: f32,
    pub threat: ThreatLevel,
}

/// Classify by speed in knots.
pub fn classify(speed_knots: f64) -> Classification {
    if speed_knots < 150.0 {
        Classification {
            label: "civilian",
            confidence: 0.85,
            threat: ThreatLevel::None,
        }
    } else if speed_knots <= 350.0 {
        Classification {
            label: "aircraft",
            confidence: 0.70,
            threat: ThreatLevel::Low,
        }
    } else {
        Classification {
            label: "military",
            confidence: 0.90,
            threat: ThreatLevel::High,
        }
    }
}

pub struct Classifier {
    cfg: ClassifierConfig,
}

impl Classifier {
    pub fn new(cfg: ClassifierConfig) -> Self {
        Self { cfg }
    }

    /// Watch tracks and classify them until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        let mut client = connect(&self.cfg.store_addr)?;

        let mut stream = client
            .watch_entities(WatchEntitiesRequest {
                type_filter: EntityType::Track as i32,
            })
            .await?
            .into_inner();

        info!(store = %self.cfg.store_addr, "classifier watching tracks");

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                next = stream.message() => {
                    let event = match next {
                        Ok(Some(event)) => event,
                        Ok(None) => return Err(ServiceError::WatchClosed),
                        Err(status) => return Err(ServiceError::Rpc(status)),
                    };
                    if event.r#type() == EventType::Deleted {
                        continue;
                    }
                    let Some(entity) = event.entity else { continue };
                    if let Err(e) = classify_entity(&mut client, &entity).await {
                        warn!(entity_id = %entity.id, error = %e, "classify failed");
                    }
                }
            }
        }
    }
}

async fn classify_entity(client: &mut StoreClient, entity: &Entity) -> Result<(), ServiceError> {
    // No velocity, nothing to classify yet.
    let Some(velocity_any) = entity.components.get(keys::VELOCITY) else {
        return Ok(());
    };
    let Ok(velocity) = VelocityComponent::from_any(velocity_any) else {
        return Ok(());
    };

    // Skip if already classified at this speed band; re-classifying on
    // every position tick would just churn the watch bus.
    let classification = classify(velocity.speed);
    if let Some(existing) = entity.components.get(keys::CLASSIFICATION) {
        if let Ok(existing) = ClassificationComponent::from_any(existing) {
            if existing.label == classification.label {
                return Ok(());
            }
        }
    }

    let mut update = Entity {
        id: entity.id.clone(),
        r#type: entity.r#type,
        ..Default::default()
    };
    update.components.insert(
        keys::CLASSIFICATION.into(),
        ClassificationComponent {
            label: classification.label.to_string(),
            confidence: classification.confidence,
        }
        .to_any(),
    );
    update.components.insert(
        keys::THREAT.into(),
        ThreatComponent {
            level: classification.threat as i32,
        }
        .to_any(),
    );

    client
        .update_entity(UpdateEntityRequest {
            entity: Some(update),
        })
        .await?;

    info!(
        entity_id = %entity.id,
        label = classification.label,
        confidence = classification.confidence,
        threat = %classification.threat,
        speed_kts = velocity.speed,
        "classified track"
    );
    Ok(())
}
