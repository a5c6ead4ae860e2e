//! gRPC surface tests: the service called in process, then over a real
//! socket with [`GrpcQueryClient`] on the other end.

mod support;

use std::time::Duration;

use pantry_api::proto::entity_query_client::EntityQueryClient;
use pantry_api::proto::entity_query_server::EntityQuery;
use pantry_api::proto::{DeleteRequest, EntityMessage, GetOneRequest, ListAllRequest};
use pantry_api::{EntityQueryService, GrpcQueryClient, QueryService, Runtime};
use pantry_core::{new_entity_id, PantryError, RoutingKey};
use pantry_test_utils::{eventually, fixtures, InMemoryBackends};
use support::{into_backends, test_config, TestHarness};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Code, Request};

fn service(harness: &TestHarness) -> EntityQueryService {
    EntityQueryService::new(
        harness.runtime.local_query.clone(),
        harness.runtime.state.publisher.clone(),
    )
}

fn message(id: &str, name: &str, ingredients: &str, duration: i64) -> EntityMessage {
    EntityMessage {
        id: id.to_string(),
        name: name.to_string(),
        ingredients: ingredients.to_string(),
        duration,
    }
}

/// Serve the harness over a loopback socket. Returns the URL and a handle
/// that stops the server when sent to.
async fn serve(harness: &TestHarness) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (stop, stopped) = oneshot::channel::<()>();
    let router = Server::builder().add_service(harness.runtime.grpc_service());
    let handle = tokio::spawn(async move {
        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = stopped.await;
            })
            .await
            .expect("server should run");
    });
    (format!("http://{}", addr), stop, handle)
}

#[tokio::test]
async fn create_is_acknowledged_not_applied() {
    let harness = TestHarness::idle(3);
    let service = service(&harness);

    let ack = service
        .create(Request::new(message("", "Soup", "water,salt", 10)))
        .await
        .expect("create should be accepted")
        .into_inner();

    assert!(ack.accepted);
    assert_eq!(ack.routing_key, RoutingKey::EntityCreate.as_str());
    let id = ack.entity_id.clone();

    // Nothing applies while the processor is idle.
    let status = service
        .get_one(Request::new(GetOneRequest { id }))
        .await
        .expect_err("entity should not exist yet");
    assert_eq!(status.code(), Code::NotFound);
}

#[tokio::test]
async fn invalid_requests_are_invalid_argument() {
    let harness = TestHarness::idle(3);
    let service = service(&harness);

    let blank = service
        .create(Request::new(message("", " ", "water", 10)))
        .await
        .expect_err("blank name should be rejected");
    assert_eq!(blank.code(), Code::InvalidArgument);

    let zero = service
        .update(Request::new(message(&new_entity_id().to_string(), "Soup", "water", 0)))
        .await
        .expect_err("zero duration should be rejected");
    assert_eq!(zero.code(), Code::InvalidArgument);

    let bad_id = service
        .delete(Request::new(DeleteRequest { id: "nope".to_string() }))
        .await
        .expect_err("malformed id should be rejected");
    assert_eq!(bad_id.code(), Code::InvalidArgument);

    let depth = pantry_broker::Broker::depth(&harness.memory.broker, RoutingKey::EntityCreate)
        .await
        .expect("depth");
    assert_eq!(depth.ready, 0);
}

#[tokio::test]
async fn broker_outage_is_unavailable() {
    let harness = TestHarness::idle(3);
    harness.memory.broker.set_available(false);

    let status = service(&harness)
        .delete(Request::new(DeleteRequest {
            id: new_entity_id().to_string(),
        }))
        .await
        .expect_err("publish should fail");
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn mutations_apply_through_the_processor() {
    let harness = TestHarness::started();
    let service = service(&harness);
    let id = new_entity_id();

    service
        .create(Request::new(message(&id.to_string(), "Soup", "water,salt", 10)))
        .await
        .expect("create accepted");
    eventually("create applied", || async { harness.stored(id).await.is_some() }).await;

    let fetched = service
        .get_one(Request::new(GetOneRequest { id: id.to_string() }))
        .await
        .expect("entity readable")
        .into_inner();
    assert_eq!(fetched, message(&id.to_string(), "Soup", "water,salt", 10));

    service
        .update(Request::new(message(&id.to_string(), "Stew", "beef,carrot,onion", 90)))
        .await
        .expect("update accepted");
    eventually("update applied", || async {
        harness.stored(id).await.map(|entity| entity.fields()) == Some(fixtures::stew_fields())
    })
    .await;

    service
        .delete(Request::new(DeleteRequest { id: id.to_string() }))
        .await
        .expect("delete accepted");
    eventually("delete applied", || async { harness.stored(id).await.is_none() }).await;

    let listing = service
        .list_all(Request::new(ListAllRequest {}))
        .await
        .expect("listing")
        .into_inner();
    assert!(listing.entities.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn remote_client_reads_over_the_wire() {
    let harness = TestHarness::started();
    let (url, stop, server) = serve(&harness).await;
    let id = new_entity_id();

    let mut raw = EntityQueryClient::connect(url.clone()).await.expect("connect");
    raw.create(message(&id.to_string(), "Soup", "water,salt", 10))
        .await
        .expect("create accepted");
    eventually("create applied", || async { harness.stored(id).await.is_some() }).await;

    let client = GrpcQueryClient::connect_lazy(url, Duration::from_secs(2)).expect("client");
    assert_eq!(client.get_one(id).await.expect("remote read"), fixtures::soup(id));
    assert_eq!(client.list_all().await.expect("remote list"), vec![fixtures::soup(id)]);

    let missing = new_entity_id();
    assert!(matches!(
        client.get_one(missing).await,
        Err(PantryError::NotFound { id }) if id == missing
    ));

    drop(raw);
    drop(client);
    let _ = stop.send(());
    server.await.expect("server task");
    harness.stop().await;
}

#[tokio::test]
async fn read_side_runtime_uses_remote_query_service() {
    let writer = TestHarness::started();
    let (url, stop, server) = serve(&writer).await;

    // A second service that owns only a cache and reads through the writer.
    let reader_memory = InMemoryBackends::new();
    let mut config = test_config(3);
    config.query_endpoint = Some(url);
    let reader = Runtime::build(&config, into_backends(&reader_memory)).expect("reader runtime");

    let id = new_entity_id();
    writer
        .runtime
        .state
        .publisher
        .create(Some(id), fixtures::soup_fields())
        .await
        .expect("accepted");
    eventually("create applied", || async { writer.stored(id).await.is_some() }).await;

    let entity = reader.state.reads.get_one(id).await.expect("remote-backed read");
    assert_eq!(entity, fixtures::soup(id));
    assert!(reader_memory
        .cache
        .contains(&pantry_storage::cache::CacheKey::Entity(id)));

    drop(reader);
    let _ = stop.send(());
    server.await.expect("server task");
    writer.stop().await;
}
