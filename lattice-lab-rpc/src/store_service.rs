//! EntityStoreService gRPC implementation

use crate::approval::{ApprovalControl, ApprovalError};
use crate::status_from_store;
use lattice_lab_proto::pb::entity_store_service_server::EntityStoreService;
use lattice_lab_proto::{
    ApproveActionRequest, CreateEntityRequest, DeleteEntityRequest, DenyActionRequest, Entity,
    EntityEvent, GetEntityRequest, ListEntitiesRequest, ListEntitiesResponse, UpdateEntityRequest,
    WatchEntitiesRequest,
};
use lattice_lab_store::EntityStore;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

pub struct StoreServiceImpl {
    store: Arc<EntityStore>,
    approvals: Option<Arc<dyn ApprovalControl>>,
}

impl StoreServiceImpl {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self {
            store,
            approvals: None,
        }
    }

    pub fn with_approvals(mut self, gate: Arc<dyn ApprovalControl>) -> Self {
        self.approvals = Some(gate);
        self
    }

    fn gate(&self) -> Result<&Arc<dyn ApprovalControl>, Status> {
        self.approvals
            .as_ref()
            .ok_or_else(|| Status::unimplemented("approval gate not wired to this server instance"))
    }
}

fn required_entity(entity: Option<Entity>) -> Result<Entity, Status> {
    let entity = entity.ok_or_else(|| Status::invalid_argument("entity is required"))?;
    if entity.id.is_empty() {
        return Err(Status::invalid_argument("entity id is required"));
    }
    Ok(entity)
}

impl From<ApprovalError> for Status {
    fn from(err: ApprovalError) -> Self {
        match &err {
            ApprovalError::NoPending(_) => Status::failed_precondition(err.to_string()),
            ApprovalError::Store(_) => Status::internal(err.to_string()),
        }
    }
}

#[tonic::async_trait]
impl EntityStoreService for StoreServiceImpl {
    async fn create_entity(
        &self,
        request: Request<CreateEntityRequest>,
    ) -> Result<Response<Entity>, Status> {
        let entity = required_entity(request.into_inner().entity)?;
        let created = self.store.create(entity).map_err(status_from_store)?;
        Ok(Response::new(created))
    }

    async fn get_entity(
        &self,
        request: Request<GetEntityRequest>,
    ) -> Result<Response<Entity>, Status> {
        let id = request.into_inner().id;
        let entity = self.store.get(&id).map_err(status_from_store)?;
        Ok(Response::new(entity))
    }

    async fn list_entities(
        &self,
        request: Request<ListEntitiesRequest>,
    ) -> Result<Response<ListEntitiesResponse>, Status> {
        let filter = request.into_inner().type_filter();
        Ok(Response::new(ListEntitiesResponse {
            entities: self.store.list(filter),
        }))
    }

    async fn update_entity(
        &self,
        request: Request<UpdateEntityRequest>,
    ) -> Result<Response<Entity>, Status> {
        let entity = required_entity(request.into_inner().entity)?;
        let updated = self.store.update(entity).map_err(status_from_store)?;
        Ok(Response::new(updated))
    }

    async fn delete_entity(
        &self,
        request: Request<DeleteEntityRequest>,
    ) -> Result<Response<()>, Status> {
        let id = request.into_inner().id;
        self.store.delete(&id).map_err(status_from_store)?;
        Ok(Response::new(()))
    }

    type WatchEntitiesStream = ReceiverStream<Result<EntityEvent, Status>>;

    async fn watch_entities(
        &self,
        request: Request<WatchEntitiesRequest>,
    ) -> Result<Response<Self::WatchEntitiesStream>, Status> {
        let filter = request.into_inner().type_filter();
        let mut watcher = self.store.watch(filter);
        let (tx, rx) = tokio::sync::mpsc::channel(lattice_lab_store::DEFAULT_WATCH_BUFFER);

        let store = self.store.clone();
        tokio::spawn(async move {
            let watcher_id = watcher.id();
            loop {
                tokio::select! {
                    // Client went away: unsubscribe promptly.
                    _ = tx.closed() => break,
                    event = watcher.recv() => match event {
                        Some(event) => {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            store.unwatch(watcher_id);
            debug!(watcher = watcher_id, "watch stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn approve_action(
        &self,
        request: Request<ApproveActionRequest>,
    ) -> Result<Response<Entity>, Status> {
        let id = request.into_inner().entity_id;
        let entity = self.gate()?.approve(&id).await?;
        Ok(Response::new(entity))
    }

    async fn deny_action(
        &self,
        request: Request<DenyActionRequest>,
    ) -> Result<Response<Entity>, Status> {
        let id = request.into_inner().entity_id;
        let entity = self.gate()?.deny(&id).await?;
        Ok(Response::new(entity))
    }
}
