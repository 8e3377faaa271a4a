//! The versioned entity store and its watch bus.

use crate::error::StoreError;
use lattice_lab_model::HlcClock;
use lattice_lab_proto::{entity_hlc, is_stamped, stamp_entity, Entity, EntityEvent, EntityType, EventType};
use prost_types::Timestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default per-watcher ring capacity.
pub const DEFAULT_WATCH_BUFFER: usize = 64;

pub type WatcherId = u64;

/// A bounded subscriber to store events. Slow consumers never block the
/// store; events that do not fit are dropped and counted.
pub struct Watcher {
    id: WatcherId,
    filter: EntityType,
    events: mpsc::Receiver<EntityEvent>,
}

impl Watcher {
    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn filter(&self) -> EntityType {
        self.filter
    }

    /// Receive the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<EntityEvent> {
        self.events.recv().await
    }
}

struct WatcherEntry {
    id: WatcherId,
    filter: EntityType,
    tx: mpsc::Sender<EntityEvent>,
}

/// Builder for [`EntityStore`].
pub struct EntityStoreBuilder {
    node_id: Option<String>,
    watch_buffer: usize,
}

impl EntityStoreBuilder {
    /// Set the node id used for HLC stamps and event origins.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = Some(id.into());
        self
    }

    /// Set the per-watcher buffer capacity.
    pub fn watch_buffer(mut self, capacity: usize) -> Self {
        self.watch_buffer = capacity.max(1);
        self
    }

    pub fn build(self) -> EntityStore {
        let node_id = self.node_id.unwrap_or_else(default_node_id);
        EntityStore {
            clock: HlcClock::new(node_id.clone()),
            node_id,
            watch_buffer: self.watch_buffer,
            entities: RwLock::new(HashMap::new()),
            ttls: RwLock::new(HashMap::new()),
            watchers: RwLock::new(Vec::new()),
            next_watcher_id: AtomicU64::new(1),
            dropped_events: AtomicU64::new(0),
        }
    }
}

fn default_node_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Thread-safe in-memory entity store.
///
/// Writers are serialized on the entity map; watcher notification happens
/// outside the write lock, under a read lock on the watcher set. Inputs and
/// outputs are cloned so callers can never mutate stored state.
pub struct EntityStore {
    entities: RwLock<HashMap<String, Entity>>,
    ttls: RwLock<HashMap<String, Instant>>,
    watchers: RwLock<Vec<WatcherEntry>>,
    clock: HlcClock,
    node_id: String,
    watch_buffer: usize,
    next_watcher_id: AtomicU64,
    dropped_events: AtomicU64,
}

impl EntityStore {
    pub fn builder() -> EntityStoreBuilder {
        EntityStoreBuilder {
            node_id: None,
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }

    /// An empty store with an auto-generated node id.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Events dropped on full watcher buffers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Add a new entity. Fails if the id is empty or already present.
    ///
    /// Locally-originated (unstamped) entities get a fresh HLC stamp and
    /// wall-clock timestamps; replicated entities keep their stamp and
    /// `created_at`, and the clock only absorbs the remote stamp.
    pub fn create(&self, e: Entity) -> Result<Entity, StoreError> {
        if e.id.is_empty() {
            return Err(StoreError::Invalid("entity id is required".into()));
        }

        let mut stored = e;
        let replicated = is_stamped(&stored);
        let now = Timestamp::from(SystemTime::now());

        let event = {
            let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
            if entities.contains_key(&stored.id) {
                return Err(StoreError::AlreadyExists(stored.id));
            }

            if replicated {
                self.clock.update(&entity_hlc(&stored));
            } else {
                stamp_entity(&mut stored, &self.clock.now());
            }
            if stored.created_at.is_none() {
                stored.created_at = Some(now);
            }
            stored.updated_at = Some(now);

            entities.insert(stored.id.clone(), stored.clone());
            self.event(EventType::Created, &stored, replicated)
        };

        self.notify(event);
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Result<Entity, StoreError> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        entities
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// All entities, optionally filtered by type. UNSPECIFIED matches all.
    pub fn list(&self, type_filter: EntityType) -> Vec<Entity> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        entities
            .values()
            .filter(|e| type_filter == EntityType::Unspecified || e.r#type() == type_filter)
            .cloned()
            .collect()
    }

    /// Merge an update into an existing entity, key by key.
    ///
    /// Keys not present in the incoming entity are retained. For keys
    /// present on both sides the incoming value is accepted only when the
    /// incoming stamp is not older than the stored one, so two writers on
    /// disjoint keys never conflict and stale writes are dropped per key.
    /// A no-op update (nothing changed) is not re-emitted on the watch bus.
    pub fn update(&self, e: Entity) -> Result<Entity, StoreError> {
        if e.id.is_empty() {
            return Err(StoreError::Invalid("entity id is required".into()));
        }

        let replicated = is_stamped(&e);

        let (merged, event) = {
            let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
            let existing = entities
                .get(&e.id)
                .ok_or_else(|| StoreError::NotFound(e.id.clone()))?;

            let existing_hlc = entity_hlc(existing);
            let incoming_hlc = if replicated {
                let incoming = entity_hlc(&e);
                self.clock.update(&incoming);
                incoming
            } else {
                // A local write is authoritative: stamp it now.
                self.clock.now()
            };

            let mut merged = existing.clone();
            for (key, value) in &e.components {
                if !merged.components.contains_key(key) || incoming_hlc >= existing_hlc {
                    merged.components.insert(key.clone(), value.clone());
                }
            }
            merged.r#type = e.r#type;

            let win_hlc = incoming_hlc.max(existing_hlc.clone());
            stamp_entity(&mut merged, &win_hlc);

            let changed = merged.components != existing.components
                || merged.r#type != existing.r#type
                || win_hlc != existing_hlc;
            if !changed {
                debug!(entity_id = %merged.id, "update is a no-op, not re-emitting");
                return Ok(merged);
            }

            merged.updated_at = Some(Timestamp::from(SystemTime::now()));
            entities.insert(merged.id.clone(), merged.clone());
            let event = self.event_with_origin(
                EventType::Updated,
                &merged,
                if replicated {
                    e.hlc_node.clone()
                } else {
                    self.node_id.clone()
                },
            );
            (merged, event)
        };

        self.notify(event);
        Ok(merged)
    }

    /// Remove an entity, emitting a DELETED event carrying its last state.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let event = {
            let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
            let removed = entities
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            self.ttls
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
            self.event(EventType::Deleted, &removed, false)
        };

        self.notify(event);
        Ok(())
    }

    // ==================== Watch bus ====================

    /// Register a bounded subscriber for entity events.
    pub fn watch(&self, type_filter: EntityType) -> Watcher {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.watch_buffer);

        self.watchers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(WatcherEntry {
                id,
                filter: type_filter,
                tx,
            });

        Watcher {
            id,
            filter: type_filter,
            events: rx,
        }
    }

    /// Remove a watcher, closing its event channel.
    pub fn unwatch(&self, id: WatcherId) {
        self.watchers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|w| w.id != id);
    }

    fn event(&self, event_type: EventType, entity: &Entity, replicated: bool) -> EntityEvent {
        let origin = if replicated {
            entity.hlc_node.clone()
        } else {
            self.node_id.clone()
        };
        self.event_with_origin(event_type, entity, origin)
    }

    fn event_with_origin(
        &self,
        event_type: EventType,
        entity: &Entity,
        origin_node: String,
    ) -> EntityEvent {
        EntityEvent {
            r#type: event_type as i32,
            entity: Some(entity.clone()),
            origin_node,
        }
    }

    /// Fan an event out to matching watchers. Never blocks: full buffers
    /// drop the event and bump the drop counter.
    fn notify(&self, event: EntityEvent) {
        let entity_type = event
            .entity
            .as_ref()
            .map(|e| e.r#type())
            .unwrap_or(EntityType::Unspecified);

        let mut stale = Vec::new();
        {
            let watchers = self.watchers.read().unwrap_or_else(|e| e.into_inner());
            for w in watchers.iter() {
                if w.filter != EntityType::Unspecified && w.filter != entity_type {
                    continue;
                }
                match w.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped_events.fetch_add(1, Ordering::Relaxed);
                        warn!(watcher = w.id, "watcher buffer full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push(w.id),
                }
            }
        }
        if !stale.is_empty() {
            self.watchers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|w| !stale.contains(&w.id));
        }
    }

    // ==================== TTL reaper ====================

    /// Arrange for an entity to be deleted once the TTL elapses. Requires a
    /// running reaper to take effect.
    pub fn set_ttl(&self, id: &str, ttl: Duration) {
        self.ttls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), Instant::now() + ttl);
    }

    /// Periodically delete expired entities until shutdown is signalled.
    pub async fn run_reaper(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("reaper shutting down");
                    return;
                }
                _ = ticker.tick() => self.reap(),
            }
        }
    }

    fn reap(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let ttls = self.ttls.read().unwrap_or_else(|e| e.into_inner());
            ttls.iter()
                .filter(|(_, expiry)| now >= **expiry)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in expired {
            match self.delete(&id) {
                Ok(()) => info!(entity_id = %id, "reaped expired entity"),
                // Already deleted by someone else; just drop the TTL entry.
                Err(_) => {
                    self.ttls
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                }
            }
        }
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}
