//! The task manager and its approval gate.

use crate::rules::{rules, TaskState};
use lattice_lab_proto::{
    keys, threat_level, ApprovalComponent, ComponentPayload, Entity, EntityStoreServiceClient,
    EntityType, EventType, GetEntityRequest, TaskCatalogComponent, ThreatLevel,
    UpdateEntityRequest, WatchEntitiesRequest,
};
use lattice_lab_rpc::{ApprovalControl, ApprovalError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

type StoreClient = EntityStoreServiceClient<Channel>;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("no pending approval for entity {0:?}")]
    NoPending(String),

    #[error("not connected to the store")]
    NotConnected,

    #[error("invalid store address {0:?}")]
    Endpoint(String),

    #[error("store rpc: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("watch stream closed")]
    WatchClosed,
}

/// Task manager configuration.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub store_addr: String,
    /// How long a PENDING_APPROVAL entity waits before auto-deny.
    pub approval_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            store_addr: "127.0.0.1:50051".to_string(),
            approval_timeout: Duration::from_secs(30),
        }
    }
}

/// Current task assignment for an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub entity_id: String,
    pub state: TaskState,
    pub tasks: Vec<String>,
}

struct ManagerState {
    assignments: HashMap<String, Assignment>,
    // Cancel handles for armed approval timers; dropping one cancels.
    pending: HashMap<String, oneshot::Sender<()>>,
    client: Option<StoreClient>,
}

/// Watches classified tracks and assigns tasks based on threat level, with
/// the approval gate in front of INTERCEPT.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: TaskConfig,
    state: Mutex<ManagerState>,
}

impl TaskManager {
    pub fn new(cfg: TaskConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                state: Mutex::new(ManagerState {
                    assignments: HashMap::new(),
                    pending: HashMap::new(),
                    client: None,
                }),
            }),
        }
    }

    pub fn get_assignment(&self, entity_id: &str) -> Option<Assignment> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .assignments
            .get(entity_id)
            .cloned()
    }

    /// Whether an approval timer is armed for this entity.
    pub fn has_pending(&self, entity_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .contains_key(entity_id)
    }

    /// Connect to the store, watch tracks, and manage assignments until
    /// shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), TaskError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.inner.cfg.store_addr))
            .map_err(|_| TaskError::Endpoint(self.inner.cfg.store_addr.clone()))?;
        let mut client = EntityStoreServiceClient::new(endpoint.connect_lazy());
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .client = Some(client.clone());

        let mut stream = client
            .watch_entities(WatchEntitiesRequest {
                type_filter: EntityType::Track as i32,
            })
            .await?
            .into_inner();

        info!(store = %self.inner.cfg.store_addr, "task manager watching tracks");

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                next = stream.message() => {
                    let event = match next {
                        Ok(Some(event)) => event,
                        Ok(None) => return Err(TaskError::WatchClosed),
                        Err(status) => return Err(TaskError::Rpc(status)),
                    };
                    let event_type = event.r#type();
                    let Some(entity) = event.entity else { continue };
                    if event_type == EventType::Deleted {
                        self.remove_assignment(&entity.id);
                    } else {
                        self.process_entity(&entity).await;
                    }
                }
            }
        }
    }

    async fn process_entity(&self, entity: &Entity) {
        let threat = threat_level(entity);
        if threat == ThreatLevel::Unspecified {
            return; // not classified yet
        }

        let (target, tasks) = rules(threat);
        if target == TaskState::Intercept {
            self.enter_pending(entity);
            return;
        }

        let (changed, client) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());

            // A downgrade while pending cancels the armed timer.
            state.pending.remove(&entity.id);

            let changed = state
                .assignments
                .get(&entity.id)
                .map(|a| a.state != target)
                .unwrap_or(true);
            state.assignments.insert(
                entity.id.clone(),
                Assignment {
                    entity_id: entity.id.clone(),
                    state: target,
                    tasks: tasks.clone(),
                },
            );
            (changed, state.client.clone())
        };

        if !changed || tasks.is_empty() {
            return;
        }

        info!(entity_id = %entity.id, state = %target, ?tasks, "task assignment");
        if let Some(client) = client {
            if let Err(status) = write_catalog(client, entity, tasks, None).await {
                warn!(entity_id = %entity.id, error = %status, "task catalog write failed");
            }
        }
    }

    /// Gate an intercept behind approval: transition to PENDING_APPROVAL,
    /// arm the auto-deny timer, and write nothing to the store yet.
    fn enter_pending(&self, entity: &Entity) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());

        // Already approved, or already waiting: nothing to do.
        if state
            .assignments
            .get(&entity.id)
            .map(|a| a.state == TaskState::Intercept)
            .unwrap_or(false)
            || state.pending.contains_key(&entity.id)
        {
            return;
        }

        state.assignments.insert(
            entity.id.clone(),
            Assignment {
                entity_id: entity.id.clone(),
                state: TaskState::PendingApproval,
                tasks: Vec::new(),
            },
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        state.pending.insert(entity.id.clone(), cancel_tx);
        drop(state);

        info!(entity_id = %entity.id, timeout = ?self.inner.cfg.approval_timeout,
            "intercept pending approval");

        let inner = self.inner.clone();
        let entity_id = entity.id.clone();
        let timeout = self.inner.cfg.approval_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => auto_deny(&inner, &entity_id),
                // Fires on both explicit cancel and sender drop.
                _ = cancel_rx => {}
            }
        });
    }

    /// Approve a pending intercept: cancel the timer, transition to
    /// INTERCEPT and write the task catalog. The store write happens
    /// outside the lock so a slow RPC never blocks the watch loop.
    pub async fn approve(&self, entity_id: &str) -> Result<Entity, TaskError> {
        let client = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let client = state.client.clone().ok_or(TaskError::NotConnected)?;
            state
                .pending
                .remove(entity_id)
                .ok_or_else(|| TaskError::NoPending(entity_id.to_string()))?;

            let (_, tasks) = rules(ThreatLevel::High);
            state.assignments.insert(
                entity_id.to_string(),
                Assignment {
                    entity_id: entity_id.to_string(),
                    state: TaskState::Intercept,
                    tasks,
                },
            );
            client
        };

        let mut client = client;
        let entity = client
            .get_entity(GetEntityRequest {
                id: entity_id.to_string(),
            })
            .await?
            .into_inner();

        let (state, tasks) = rules(ThreatLevel::High);
        let updated = write_catalog(client, &entity, tasks, Some(state)).await?;
        info!(entity_id, "intercept approved");
        Ok(updated)
    }

    /// Deny a pending intercept: cancel the timer and drop back to IDLE.
    /// No task catalog is written.
    pub async fn deny(&self, entity_id: &str) -> Result<Entity, TaskError> {
        let client = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let client = state.client.clone().ok_or(TaskError::NotConnected)?;
            state
                .pending
                .remove(entity_id)
                .ok_or_else(|| TaskError::NoPending(entity_id.to_string()))?;

            state.assignments.insert(
                entity_id.to_string(),
                Assignment {
                    entity_id: entity_id.to_string(),
                    state: TaskState::Idle,
                    tasks: Vec::new(),
                },
            );
            client
        };

        info!(entity_id, "intercept denied");
        let mut client = client;
        let entity = client
            .get_entity(GetEntityRequest {
                id: entity_id.to_string(),
            })
            .await?
            .into_inner();
        Ok(entity)
    }

    /// Entity deleted: drop the assignment and cancel any armed timer.
    fn remove_assignment(&self, entity_id: &str) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.assignments.remove(entity_id);
        if state.pending.remove(entity_id).is_some() {
            info!(entity_id, "cancelled pending approval for deleted entity");
        }
    }
}

fn auto_deny(inner: &Arc<Inner>, entity_id: &str) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    if state.pending.remove(entity_id).is_none() {
        return; // resolved concurrently
    }
    state.assignments.insert(
        entity_id.to_string(),
        Assignment {
            entity_id: entity_id.to_string(),
            state: TaskState::Idle,
            tasks: Vec::new(),
        },
    );
    warn!(entity_id, "approval timed out, auto-deny");
}

async fn write_catalog(
    mut client: StoreClient,
    entity: &Entity,
    tasks: Vec<String>,
    approved_state: Option<TaskState>,
) -> Result<Entity, tonic::Status> {
    let catalog = TaskCatalogComponent {
        available_tasks: tasks,
    };
    // Minimal unstamped update: only the keys this service owns.
    let mut update = Entity {
        id: entity.id.clone(),
        r#type: entity.r#type,
        ..Default::default()
    };
    update
        .components
        .insert(keys::TASK_CATALOG.into(), catalog.to_any());
    if let Some(state) = approved_state {
        let approval = ApprovalComponent {
            state: state.to_string(),
        };
        update
            .components
            .insert(keys::APPROVAL.into(), approval.to_any());
    }

    Ok(client
        .update_entity(UpdateEntityRequest {
            entity: Some(update),
        })
        .await?
        .into_inner())
}

#[async_trait::async_trait]
impl ApprovalControl for TaskManager {
    async fn approve(&self, entity_id: &str) -> Result<Entity, ApprovalError> {
        TaskManager::approve(self, entity_id)
            .await
            .map_err(|e| match e {
                TaskError::NoPending(id) => ApprovalError::NoPending(id),
                other => ApprovalError::Store(other.to_string()),
            })
    }

    async fn deny(&self, entity_id: &str) -> Result<Entity, ApprovalError> {
        TaskManager::deny(self, entity_id)
            .await
            .map_err(|e| match e {
                TaskError::NoPending(id) => ApprovalError::NoPending(id),
                other => ApprovalError::Store(other.to_string()),
            })
    }
}
