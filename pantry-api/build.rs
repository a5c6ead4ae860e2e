//! Build script for PANTRY API
//!
//! Generates the `EntityQuery` gRPC client and server stubs with
//! `tonic_build::manual`, so no protoc is needed. The message types are
//! hand-written prost structs in `src/grpc.rs`; the stubs refer to them as
//! `super::<Message>` from inside the `proto` module.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic_prost::ProstCodec";

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("super::{}", input))
        .output_type(format!("super::{}", output))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let entity_query = Service::builder()
        .name("EntityQuery")
        .package("pantry")
        .comment("Read interface over the entity store, plus publisher-backed mutations.")
        .method(method("get_one", "GetOne", "GetOneRequest", "EntityMessage"))
        .method(method("list_all", "ListAll", "ListAllRequest", "ListAllResponse"))
        .method(method("create", "Create", "EntityMessage", "Ack"))
        .method(method("update", "Update", "EntityMessage", "Ack"))
        .method(method("delete", "Delete", "DeleteRequest", "Ack"))
        .build();

    Builder::new()
        .build_client(true)
        .build_server(true)
        .compile(&[entity_query]);

    println!("cargo:rerun-if-changed=build.rs");
}
