//! gRPC Service Implementation
//!
//! The `pantry.EntityQuery` service. Reads go straight to a [`QueryService`]
//! (this is the remote side of the read orchestrator's cache miss, so it
//! never consults the cache); mutations go through the command publisher and
//! answer with an acceptance, exactly like the REST surface.
//!
//! [`GrpcQueryClient`] is the other end: a [`QueryService`] that calls a
//! remote `EntityQuery` over tonic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pantry_core::{Entity, EntityFields, EntityId, PantryError, PantryResult};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};

use crate::error::{ApiError, ErrorCode};
use crate::publisher::{Acceptance, CommandPublisher};
use crate::query::QueryService;

// ============================================================================
// PROTO MESSAGES
// ============================================================================

/// Messages and generated stubs for package `pantry`.
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct EntityMessage {
        /// Empty on `Create` to have an id generated.
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub name: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub ingredients: ::prost::alloc::string::String,
        #[prost(int64, tag = "4")]
        pub duration: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetOneRequest {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct ListAllRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ListAllResponse {
        #[prost(message, repeated, tag = "1")]
        pub entities: ::prost::alloc::vec::Vec<EntityMessage>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteRequest {
        #[prost(string, tag = "1")]
        pub id: ::prost::alloc::string::String,
    }

    /// Acceptance of a mutation. Not a confirmation that it was applied.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ack {
        #[prost(bool, tag = "1")]
        pub accepted: bool,
        #[prost(string, tag = "2")]
        pub command_id: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub entity_id: ::prost::alloc::string::String,
        #[prost(string, tag = "4")]
        pub routing_key: ::prost::alloc::string::String,
    }

    include!(concat!(env!("OUT_DIR"), "/pantry.EntityQuery.rs"));
}

use proto::entity_query_client::EntityQueryClient;
use proto::entity_query_server::{EntityQuery, EntityQueryServer};
use proto::*;

// ============================================================================
// CONVERSION HELPERS
// ============================================================================

/// Convert ApiError to tonic Status
impl From<ApiError> for Status {
    fn from(err: ApiError) -> Self {
        match err.code {
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat
            | ErrorCode::SerializationFailed => Status::invalid_argument(err.message),
            ErrorCode::EntityNotFound | ErrorCode::DeadLetterNotFound => {
                Status::not_found(err.message)
            }
            ErrorCode::ApplyConflict => Status::failed_precondition(err.message),
            ErrorCode::BrokerUnavailable
            | ErrorCode::CacheUnavailable
            | ErrorCode::QueryUnavailable => Status::unavailable(err.message),
            ErrorCode::Timeout => Status::deadline_exceeded(err.message),
            ErrorCode::InternalError | ErrorCode::StoreError => Status::internal(err.message),
        }
    }
}

fn status_from(err: PantryError) -> Status {
    ApiError::from(err).into()
}

fn parse_id(raw: &str) -> Result<EntityId, Status> {
    pantry_core::parse_entity_id(raw).map_err(|e| ApiError::from(e).into())
}

fn entity_to_proto(entity: Entity) -> EntityMessage {
    EntityMessage {
        id: entity.id.to_string(),
        name: entity.name,
        ingredients: entity.ingredients,
        duration: entity.duration,
    }
}

fn entity_from_proto(message: EntityMessage) -> PantryResult<Entity> {
    let id = pantry_core::parse_entity_id(&message.id)?;
    let fields = EntityFields::new(message.name, message.ingredients, message.duration);
    Ok(Entity::new(id, fields)?)
}

fn acceptance_to_proto(acceptance: Acceptance) -> Ack {
    Ack {
        accepted: true,
        command_id: acceptance.command_id.to_string(),
        entity_id: acceptance.entity_id.to_string(),
        routing_key: acceptance.routing_key.as_str().to_string(),
    }
}

// ============================================================================
// ENTITY QUERY SERVICE IMPLEMENTATION
// ============================================================================

pub struct EntityQueryService {
    query: Arc<dyn QueryService>,
    publisher: Arc<CommandPublisher>,
}

impl EntityQueryService {
    pub fn new(query: Arc<dyn QueryService>, publisher: Arc<CommandPublisher>) -> Self {
        Self { query, publisher }
    }
}

#[tonic::async_trait]
impl EntityQuery for EntityQueryService {
    async fn get_one(
        &self,
        request: Request<GetOneRequest>,
    ) -> Result<Response<EntityMessage>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let entity = self.query.get_one(id).await.map_err(status_from)?;
        Ok(Response::new(entity_to_proto(entity)))
    }

    async fn list_all(
        &self,
        _request: Request<ListAllRequest>,
    ) -> Result<Response<ListAllResponse>, Status> {
        let entities = self.query.list_all().await.map_err(status_from)?;
        Ok(Response::new(ListAllResponse {
            entities: entities.into_iter().map(entity_to_proto).collect(),
        }))
    }

    async fn create(&self, request: Request<EntityMessage>) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let id = if req.id.trim().is_empty() {
            None
        } else {
            Some(parse_id(&req.id)?)
        };
        let fields = EntityFields::new(req.name, req.ingredients, req.duration);

        let acceptance = self.publisher.create(id, fields).await.map_err(status_from)?;
        Ok(Response::new(acceptance_to_proto(acceptance)))
    }

    async fn update(&self, request: Request<EntityMessage>) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let id = parse_id(&req.id)?;
        let fields = EntityFields::new(req.name, req.ingredients, req.duration);

        let acceptance = self.publisher.update(id, fields).await.map_err(status_from)?;
        Ok(Response::new(acceptance_to_proto(acceptance)))
    }

    async fn delete(&self, request: Request<DeleteRequest>) -> Result<Response<Ack>, Status> {
        let id = parse_id(&request.into_inner().id)?;
        let acceptance = self.publisher.delete(id).await.map_err(status_from)?;
        Ok(Response::new(acceptance_to_proto(acceptance)))
    }
}

/// Build the tonic service for the gRPC server.
pub fn create_service(
    query: Arc<dyn QueryService>,
    publisher: Arc<CommandPublisher>,
) -> EntityQueryServer<EntityQueryService> {
    EntityQueryServer::new(EntityQueryService::new(query, publisher))
}

// ============================================================================
// REMOTE QUERY CLIENT
// ============================================================================

/// [`QueryService`] backed by a remote `EntityQuery` server.
///
/// The channel connects lazily, so a server that is down at startup only
/// fails the reads that need it.
#[derive(Clone)]
pub struct GrpcQueryClient {
    client: EntityQueryClient<Channel>,
}

impl GrpcQueryClient {
    pub fn connect_lazy(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| ApiError::invalid_input(format!("Invalid query endpoint {}: {}", endpoint, e)))?
            .timeout(timeout)
            .connect_lazy();
        Ok(Self {
            client: EntityQueryClient::new(channel),
        })
    }
}

fn pantry_error_from(status: Status, id: Option<EntityId>, operation: &str) -> PantryError {
    match (status.code(), id) {
        (Code::NotFound, Some(id)) => PantryError::NotFound { id },
        (Code::DeadlineExceeded, _) => PantryError::Timeout {
            operation: operation.to_string(),
            elapsed_ms: 0,
        },
        (Code::InvalidArgument, _) => PantryError::serialization(status.message()),
        _ => PantryError::QueryUnavailable {
            reason: format!("{}: {}", status.code(), status.message()),
        },
    }
}

#[async_trait]
impl QueryService for GrpcQueryClient {
    async fn get_one(&self, id: EntityId) -> PantryResult<Entity> {
        let mut client = self.client.clone();
        let response = client
            .get_one(GetOneRequest { id: id.to_string() })
            .await
            .map_err(|status| pantry_error_from(status, Some(id), "get_one"))?;
        entity_from_proto(response.into_inner())
    }

    async fn list_all(&self) -> PantryResult<Vec<Entity>> {
        let mut client = self.client.clone();
        let response = client
            .list_all(ListAllRequest {})
            .await
            .map_err(|status| pantry_error_from(status, None, "list_all"))?;
        response
            .into_inner()
            .entities
            .into_iter()
            .map(entity_from_proto)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::new_entity_id;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::missing_field("name"), Code::InvalidArgument),
            (ApiError::entity_not_found("x"), Code::NotFound),
            (ApiError::broker_unavailable("down"), Code::Unavailable),
            (ApiError::timeout("get_one"), Code::DeadlineExceeded),
            (ApiError::internal_error("boom"), Code::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn test_client_error_mapping() {
        let id = new_entity_id();
        assert_eq!(
            pantry_error_from(Status::not_found("gone"), Some(id), "get_one"),
            PantryError::NotFound { id }
        );
        assert!(matches!(
            pantry_error_from(Status::deadline_exceeded("slow"), None, "list_all"),
            PantryError::Timeout { .. }
        ));
        assert!(matches!(
            pantry_error_from(Status::unavailable("down"), Some(id), "get_one"),
            PantryError::QueryUnavailable { .. }
        ));
    }

    #[test]
    fn test_proto_conversion_checks_fields() {
        let entity = Entity::new(new_entity_id(), EntityFields::new("Soup", "water", 10)).unwrap();
        let message = entity_to_proto(entity.clone());
        assert_eq!(entity_from_proto(message.clone()).unwrap(), entity);

        let bad = EntityMessage {
            duration: 0,
            ..message
        };
        assert!(matches!(
            entity_from_proto(bad),
            Err(PantryError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_endpoint() {
        let err = GrpcQueryClient::connect_lazy("not a uri", Duration::from_secs(1)).err();
        assert!(matches!(err, Some(ApiError { code: ErrorCode::InvalidInput, .. })));
    }
}
