//! EO sensor simulator: dead-reckons a handful of tracks inside a bounding
//! box and streams them to an entity store.

use crate::{connect, ServiceError, StoreClient};
use lattice_lab_proto::{
    keys, ComponentPayload, CreateEntityRequest, Entity, EntityType, PositionComponent,
    SourceComponent, UpdateEntityRequest, VelocityComponent,
};
use rand::Rng;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;
pub const KNOTS_TO_MPS: f64 = 0.514444;

/// Geographic bounding box tracks spawn in.
#[derive(Debug, Clone, Copy)]
pub struct BBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// DC metro area.
impl Default for BBox {
    fn default() -> Self {
        Self {
            min_lat: 38.8,
            max_lat: 39.0,
            min_lon: -77.2,
            max_lon: -76.9,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub store_addr: String,
    pub interval: Duration,
    pub num_tracks: usize,
    pub sensor_id: String,
    pub bbox: BBox,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:50051".to_string(),
            interval: Duration::from_secs(1),
            num_tracks: 5,
            sensor_id: "eo-1".to_string(),
            bbox: BBox::default(),
        }
    }
}

/// One simulated aircraft track.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// Meters per second.
    pub speed: f64,
    /// Degrees, 0 = north, clockwise.
    pub heading: f64,
    created: bool,
}

impl Track {
    pub fn spawn(id: String, bbox: &BBox) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            id,
            lat: rng.gen_range(bbox.min_lat..bbox.max_lat),
            lon: rng.gen_range(bbox.min_lon..bbox.max_lon),
            alt: rng.gen_range(1_000.0..6_000.0),
            speed: rng.gen_range(100.0..500.0) * KNOTS_TO_MPS,
            heading: rng.gen_range(0.0..360.0),
            created: false,
        }
    }
}

/// Dead-reckon a track forward, flat-earth approximation.
pub fn advance_track(track: &mut Track, dt: Duration) {
    let heading_rad = track.heading.to_radians();
    let ds = track.speed * dt.as_secs_f64();

    track.lat += (ds * heading_rad.cos()) / METERS_PER_DEGREE_LAT;
    track.lon += (ds * heading_rad.sin()) / (METERS_PER_DEGREE_LAT * track.lat.to_radians().cos());
}

pub struct Simulator {
    cfg: SensorConfig,
    tracks: Vec<Track>,
}

impl Simulator {
    pub fn new(cfg: SensorConfig) -> Self {
        let tracks = (0..cfg.num_tracks)
            .map(|i| Track::spawn(format!("track-{i}"), &cfg.bbox))
            .collect();
        Self { cfg, tracks }
    }

    /// Stream track updates to the store until shutdown.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        let mut client = connect(&self.cfg.store_addr)?;
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            num_tracks = self.cfg.num_tracks,
            interval = ?self.cfg.interval,
            store = %self.cfg.store_addr,
            sensor_id = %self.cfg.sensor_id,
            "sensor simulator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = ticker.tick() => {
                    for track in &mut self.tracks {
                        if let Err(e) =
                            tick(&mut client, track, &self.cfg.sensor_id, self.cfg.interval).await
                        {
                            warn!(track_id = %track.id, error = %e, "tick failed");
                        }
                    }
                }
            }
        }
    }
}

async fn tick(
    client: &mut StoreClient,
    track: &mut Track,
    sensor_id: &str,
    interval: Duration,
) -> Result<(), ServiceError> {
    if !track.created {
        client
            .create_entity(CreateEntityRequest {
                entity: Some(build_entity(track, sensor_id)),
            })
            .await?;
        track.created = true;
        info!(track_id = %track.id, lat = track.lat, lon = track.lon, "created track");
        return Ok(());
    }

    advance_track(track, interval);
    client
        .update_entity(UpdateEntityRequest {
            entity: Some(build_entity(track, sensor_id)),
        })
        .await?;
    Ok(())
}

pub fn build_entity(track: &Track, sensor_id: &str) -> Entity {
    let mut entity = Entity {
        id: track.id.clone(),
        r#type: EntityType::Track as i32,
        ..Default::default()
    };
    entity.components.insert(
        keys::POSITION.into(),
        PositionComponent {
            lat: track.lat,
            lon: track.lon,
            alt: track.alt,
        }
        .to_any(),
    );
    entity.components.insert(
        keys::VELOCITY.into(),
        VelocityComponent {
            speed: track.speed / KNOTS_TO_MPS, // stored in knots
            heading: track.heading,
        }
        .to_any(),
    );
    entity.components.insert(
        keys::SOURCE.into(),
        SourceComponent {
            sensor_id: sensor_id.to_string(),
            sensor_type: "eo".to_string(),
        }
        .to_any(),
    );
    entity
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_track(heading: f64, speed_mps: f64) -> Track {
        Track {
            id: "t-0".into(),
            lat: 38.9,
            lon: -77.0,
            alt: 3_000.0,
            speed: speed_mps,
            heading,
            created: false,
        }
    }

    #[test]
    fn northbound_track_gains_latitude() {
        let mut track = test_track(0.0, 100.0);
        let before = (track.lat, track.lon);
        advance_track(&mut track, Duration::from_secs(10));

        assert!(track.lat > before.0);
        assert!((track.lon - before.1).abs() < 1e-9);
        // 1000 m north ≈ 0.009 degrees.
        assert!((track.lat - before.0 - 1000.0 / METERS_PER_DEGREE_LAT).abs() < 1e-6);
    }

    #[test]
    fn eastbound_track_gains_longitude() {
        let mut track = test_track(90.0, 100.0);
        let before = (track.lat, track.lon);
        advance_track(&mut track, Duration::from_secs(10));

        assert!(track.lon > before.1);
        assert!((track.lat - before.0).abs() < 1e-6);
    }

    #[test]
    fn spawned_tracks_stay_in_bbox() {
        let bbox = BBox::default();
        for i in 0..100 {
            let track = Track::spawn(format!("t-{i}"), &bbox);
            assert!(track.lat >= bbox.min_lat && track.lat <= bbox.max_lat);
            assert!(track.lon >= bbox.min_lon && track.lon <= bbox.max_lon);
            assert!(track.alt >= 1_000.0 && track.alt <= 6_000.0);
        }
    }

    #[test]
    fn built_entity_carries_position_velocity_source() {
        let track = test_track(45.0, 150.0 * KNOTS_TO_MPS);
        let entity = build_entity(&track, "eo-7");

        assert_eq!(entity.r#type(), EntityType::Track);
        let velocity =
            VelocityComponent::from_any(&entity.components[keys::VELOCITY]).unwrap();
        assert!((velocity.speed - 150.0).abs() < 1e-9);

        let source = SourceComponent::from_any(&entity.components[keys::SOURCE]).unwrap();
        assert_eq!(source.sensor_id, "eo-7");
        assert_eq!(source.sensor_type, "eo");
    }
}
