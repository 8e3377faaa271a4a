//! Radar simulator: the same motion model as the EO sensor at a slower
//! revisit rate, with position jitter and no velocity estimate, which is
//! what makes its tracks interesting to the fusion service.

use crate::sensor::{advance_track, BBox, Track};
use crate::{connect, ServiceError, StoreClient};
use lattice_lab_proto::{
    keys, ComponentPayload, CreateEntityRequest, Entity, EntityType, PositionComponent,
    SourceComponent, UpdateEntityRequest,
};
use rand::Rng;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Per-update position jitter in degrees.
const JITTER_DEG: f64 = 0.002;

#[derive(Debug, Clone)]
pub struct RadarConfig {
    pub store_addr: String,
    pub interval: Duration,
    pub num_tracks: usize,
    pub sensor_id: String,
    pub bbox: BBox,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:50051".to_string(),
            interval: Duration::from_secs(2),
            num_tracks: 3,
            sensor_id: "radar-1".to_string(),
            bbox: BBox::default(),
        }
    }
}

pub struct RadarSimulator {
    cfg: RadarConfig,
    tracks: Vec<Track>,
    created: Vec<bool>,
}

impl RadarSimulator {
    pub fn new(cfg: RadarConfig) -> Self {
        let tracks: Vec<Track> = (0..cfg.num_tracks)
            .map(|i| Track::spawn(format!("radar-track-{i}"), &cfg.bbox))
            .collect();
        let created = vec![false; tracks.len()];
        Self {
            cfg,
            tracks,
            created,
        }
    }

    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        let mut client = connect(&self.cfg.store_addr)?;
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            num_tracks = self.cfg.num_tracks,
            interval = ?self.cfg.interval,
            store = %self.cfg.store_addr,
            sensor_id = %self.cfg.sensor_id,
            "radar simulator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = ticker.tick() => {
                    for i in 0..self.tracks.len() {
                        if let Err(e) = self.tick(&mut client, i).await {
                            warn!(track_id = %self.tracks[i].id, error = %e, "tick failed");
                        }
                    }
                }
            }
        }
    }

    async fn tick(&mut self, client: &mut StoreClient, index: usize) -> Result<(), ServiceError> {
        if !self.created[index] {
            let entity = build_entity(&self.tracks[index], &self.cfg.sensor_id);
            client
                .create_entity(CreateEntityRequest {
                    entity: Some(entity),
                })
                .await?;
            self.created[index] = true;
            let track = &self.tracks[index];
            info!(track_id = %track.id, lat = track.lat, lon = track.lon, "created radar track");
            return Ok(());
        }

        let track = &mut self.tracks[index];
        advance_track(track, self.cfg.interval);
        add_jitter(track);

        let entity = build_entity(track, &self.cfg.sensor_id);
        client
            .update_entity(UpdateEntityRequest {
                entity: Some(entity),
            })
            .await?;
        Ok(())
    }
}

fn add_jitter(track: &mut Track) {
    let mut rng = rand::thread_rng();
    track.lat += rng.gen_range(-JITTER_DEG..JITTER_DEG);
    track.lon += rng.gen_range(-JITTER_DEG..JITTER_DEG);
}

/// Radar returns carry position and source only; no velocity estimate.
fn build_entity(track: &Track, sensor_id: &str) -> Entity {
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
        keys::SOURCE.into(),
        SourceComponent {
            sensor_id: sensor_id.to_string(),
            sensor_type: "radar".to_string(),
        }
        .to_any(),
    );
    entity
}
