//! Sensor fusion: correlate tracks of the same real-world object seen by
//! different sensors, and maintain fused entities in the store.
//!
//! Distances are flat-earth Euclidean in degrees, which is fine at the
//! ranges the simulators operate over.

use crate::{connect, ServiceError, StoreClient};
use lattice_lab_proto::{
    keys, ComponentPayload, CreateEntityRequest, DeleteEntityRequest, Entity, EntityType,
    EventType, FusionComponent, PositionComponent, SourceComponent, UpdateEntityRequest,
    WatchEntitiesRequest,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub store_addr: String,
    /// Correlation threshold in degrees (~1.1 km at the default).
    pub dist_threshold: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:50051".to_string(),
            dist_threshold: 0.01,
        }
    }
}

/// Position and source extracted from a track entity.
#[derive(Debug, Clone)]
struct TrackInfo {
    entity_id: String,
    lat: f64,
    lon: f64,
    sensor_id: String,
}

/// A pair of tracks from different sensors close enough to be one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub track_a: String,
    pub track_b: String,
    /// Deterministic id of the fused entity (sorted source ids).
    pub fused_id: String,
}

pub struct Fusioner {
    cfg: FusionConfig,
    tracks: Mutex<HashMap<String, TrackInfo>>,
}

impl Fusioner {
    pub fn new(cfg: FusionConfig) -> Self {
        Self {
            cfg,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    /// Record a track's position and source. Returns false when the entity
    /// lacks either component.
    pub fn update_track(&self, entity: &Entity) -> bool {
        let Some(info) = extract_track_info(entity) else {
            return false;
        };
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.entity_id.clone(), info);
        true
    }

    pub fn remove_track(&self, entity_id: &str) {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
    }

    /// All current cross-sensor correlations. The pure, testable core of
    /// the fusion logic.
    pub fn correlations(&self) -> Vec<Correlation> {
        let tracks = self.tracks.lock().unwrap_or_else(|e| e.into_inner());
        correlate(tracks.values(), self.cfg.dist_threshold)
    }

    /// Build fused entities for every current correlation.
    pub fn build_fused_entities(&self) -> Vec<Entity> {
        let tracks = self.tracks.lock().unwrap_or_else(|e| e.into_inner());
        let correlations = correlate(tracks.values(), self.cfg.dist_threshold);

        let mut entities = Vec::with_capacity(correlations.len());
        for c in correlations {
            let (Some(a), Some(b)) = (tracks.get(&c.track_a), tracks.get(&c.track_b)) else {
                continue;
            };

            let lat = (a.lat + b.lat) / 2.0;
            let lon = (a.lon + b.lon) / 2.0;
            let dist = distance(a.lat, a.lon, b.lat, b.lon);
            // Closer pairs fuse with more confidence, floored at 0.1.
            let confidence = (1.0 - dist / self.cfg.dist_threshold).max(0.1) as f32;

            let mut entity = Entity {
                id: c.fused_id.clone(),
                r#type: EntityType::Track as i32,
                ..Default::default()
            };
            entity.components.insert(
                keys::FUSION.into(),
                FusionComponent {
                    source_ids: vec![c.track_a.clone(), c.track_b.clone()],
                    fused_lat: lat,
                    fused_lon: lon,
                    confidence,
                }
                .to_any(),
            );
            entity.components.insert(
                keys::POSITION.into(),
                PositionComponent {
                    lat,
                    lon,
                    alt: 0.0,
                }
                .to_any(),
            );
            entities.push(entity);
        }
        entities
    }

    /// Watch all tracks, keep fused entities in sync, until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        let mut client = connect(&self.cfg.store_addr)?;

        let mut stream = client
            .watch_entities(WatchEntitiesRequest {
                type_filter: EntityType::Track as i32,
            })
            .await?
            .into_inner();

        info!(
            store = %self.cfg.store_addr,
            dist_threshold = self.cfg.dist_threshold,
            "fusion service watching tracks"
        );

        // Fused entities currently alive in the store.
        let mut active: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                next = stream.message() => {
                    let event = match next {
                        Ok(Some(event)) => event,
                        Ok(None) => return Err(ServiceError::WatchClosed),
                        Err(status) => return Err(ServiceError::Rpc(status)),
                    };
                    let event_type = event.r#type();
                    let Some(entity) = event.entity else { continue };

                    // Our own fused entities come back on the watch stream;
                    // feeding them into correlation would fuse fusions.
                    if entity.components.contains_key(keys::FUSION) {
                        continue;
                    }

                    if event_type == EventType::Deleted {
                        self.remove_track(&entity.id);
                    } else {
                        self.update_track(&entity);
                    }

                    self.reconcile(&mut client, &mut active).await;
                }
            }
        }
    }

    /// Create/update fused entities for current correlations and delete the
    /// ones whose correlation lapsed.
    async fn reconcile(&self, client: &mut StoreClient, active: &mut HashSet<String>) {
        let fused = self.build_fused_entities();
        let mut next_active = HashSet::with_capacity(fused.len());

        for entity in fused {
            let id = entity.id.clone();
            next_active.insert(id.clone());
            let result = if active.contains(&id) {
                client
                    .update_entity(UpdateEntityRequest {
                        entity: Some(entity),
                    })
                    .await
                    .map(|_| ())
            } else {
                info!(fused_id = %id, "created fused entity");
                client
                    .create_entity(CreateEntityRequest {
                        entity: Some(entity),
                    })
                    .await
                    .map(|_| ())
            };
            if let Err(status) = result {
                warn!(fused_id = %id, error = %status, "fused entity write failed");
            }
        }

        for id in active.iter() {
            if !next_active.contains(id) {
                match client
                    .delete_entity(DeleteEntityRequest { id: id.clone() })
                    .await
                {
                    Ok(_) => info!(fused_id = %id, "deleted stale fused entity"),
                    Err(status) => {
                        warn!(fused_id = %id, error = %status, "fused entity delete failed")
                    }
                }
            }
        }

        *active = next_active;
    }
}

fn correlate<'a>(
    tracks: impl Iterator<Item = &'a TrackInfo>,
    threshold: f64,
) -> Vec<Correlation> {
    let all: Vec<&TrackInfo> = tracks.collect();
    let mut correlations = Vec::new();
    for i in 0..all.len() {
        for j in (i + 1)..all.len() {
            let (a, b) = (all[i], all[j]);
            if a.sensor_id == b.sensor_id {
                continue;
            }
            if distance(a.lat, a.lon, b.lat, b.lon) < threshold {
                let mut ids = [a.entity_id.as_str(), b.entity_id.as_str()];
                ids.sort_unstable();
                correlations.push(Correlation {
                    track_a: a.entity_id.clone(),
                    track_b: b.entity_id.clone(),
                    fused_id: format!("fused-{}-{}", ids[0], ids[1]),
                });
            }
        }
    }
    correlations
}

/// Euclidean distance in degrees, flat-earth approximation.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    (dlat * dlat + dlon * dlon).sqrt()
}

fn extract_track_info(entity: &Entity) -> Option<TrackInfo> {
    let position = PositionComponent::from_any(entity.components.get(keys::POSITION)?).ok()?;
    let source = SourceComponent::from_any(entity.components.get(keys::SOURCE)?).ok()?;
    Some(TrackInfo {
        entity_id: entity.id.clone(),
        lat: position.lat,
        lon: position.lon,
        sensor_id: source.sensor_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, lat: f64, lon: f64, sensor: &str) -> Entity {
        let mut entity = Entity {
            id: id.into(),
            r#type: EntityType::Track as i32,
            ..Default::default()
        };
        entity.components.insert(
            keys::POSITION.into(),
            PositionComponent { lat, lon, alt: 0.0 }.to_any(),
        );
        entity.components.insert(
            keys::SOURCE.into(),
            SourceComponent {
                sensor_id: sensor.into(),
                sensor_type: "test".into(),
            }
            .to_any(),
        );
        entity
    }

    #[test]
    fn distance_is_euclidean() {
        assert_eq!(distance(0.0, 0.0, 3.0, 4.0), 5.0);
        assert_eq!(distance(1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn close_tracks_from_different_sensors_correlate() {
        let fusioner = Fusioner::new(FusionConfig::default());
        assert!(fusioner.update_track(&track("t-eo", 38.9, -77.0, "eo-1")));
        assert!(fusioner.update_track(&track("t-radar", 38.9005, -77.0005, "radar-1")));

        let correlations = fusioner.correlations();
        assert_eq!(correlations.len(), 1);
        assert_eq!(correlations[0].fused_id, "fused-t-eo-t-radar");
    }

    #[test]
    fn same_sensor_pairs_never_correlate() {
        let fusioner = Fusioner::new(FusionConfig::default());
        fusioner.update_track(&track("t-1", 38.9, -77.0, "eo-1"));
        fusioner.update_track(&track("t-2", 38.9, -77.0, "eo-1"));

        assert!(fusioner.correlations().is_empty());
    }

    #[test]
    fn distant_tracks_do_not_correlate() {
        let fusioner = Fusioner::new(FusionConfig::default());
        fusioner.update_track(&track("t-1", 38.9, -77.0, "eo-1"));
        fusioner.update_track(&track("t-2", 39.5, -76.0, "radar-1"));

        assert!(fusioner.correlations().is_empty());
    }

    #[test]
    fn fused_id_is_order_independent() {
        let cfg = FusionConfig::default();

        let forward = Fusioner::new(cfg.clone());
        forward.update_track(&track("alpha", 38.9, -77.0, "eo-1"));
        forward.update_track(&track("beta", 38.9, -77.0, "radar-1"));

        let reverse = Fusioner::new(cfg);
        reverse.update_track(&track("beta", 38.9, -77.0, "radar-1"));
        reverse.update_track(&track("alpha", 38.9, -77.0, "eo-1"));

        assert_eq!(
            forward.correlations()[0].fused_id,
            reverse.correlations()[0].fused_id
        );
    }

    #[test]
    fn fused_entity_carries_average_position_and_confidence() {
        let fusioner = Fusioner::new(FusionConfig::default());
        fusioner.update_track(&track("t-a", 38.0, -77.0, "eo-1"));
        fusioner.update_track(&track("t-b", 38.002, -77.002, "radar-1"));

        let fused = fusioner.build_fused_entities();
        assert_eq!(fused.len(), 1);

        let fusion = FusionComponent::from_any(&fused[0].components[keys::FUSION]).unwrap();
        assert!((fusion.fused_lat - 38.001).abs() < 1e-9);
        assert!((fusion.fused_lon - -77.001).abs() < 1e-9);
        assert!(fusion.confidence > 0.1 && fusion.confidence < 1.0);
        assert_eq!(fusion.source_ids.len(), 2);

        let position = PositionComponent::from_any(&fused[0].components[keys::POSITION]).unwrap();
        assert!((position.lat - fusion.fused_lat).abs() < 1e-9);
    }

    #[test]
    fn removing_a_track_drops_its_correlation() {
        let fusioner = Fusioner::new(FusionConfig::default());
        fusioner.update_track(&track("t-a", 38.9, -77.0, "eo-1"));
        fusioner.update_track(&track("t-b", 38.9, -77.0, "radar-1"));
        assert_eq!(fusioner.correlations().len(), 1);

        fusioner.remove_track("t-a");
        assert!(fusioner.correlations().is_empty());
    }

    #[test]
    fn entity_without_source_is_ignored() {
        let fusioner = Fusioner::new(FusionConfig::default());
        let mut incomplete = track("t-a", 38.9, -77.0, "eo-1");
        incomplete.components.remove(keys::SOURCE);
        assert!(!fusioner.update_track(&incomplete));
    }
}
