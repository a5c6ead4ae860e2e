//! PANTRY API Server Entry Point
//!
//! Loads configuration from the environment, wires the backends, starts the
//! processor workers and serves REST and gRPC until Ctrl-C.

use pantry_api::telemetry::{init_tracing, TelemetryConfig};
use pantry_api::{ApiError, ApiResult, Backends, PantryConfig, Runtime};
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let config = PantryConfig::from_env();
    init_tracing(&TelemetryConfig::with_format(config.log_format))?;

    let runtime = Runtime::build(&config, Backends::from_config(&config)?)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = runtime.spawn_workers(shutdown_rx.clone());

    let api_addr = config.api_addr()?;
    let grpc_addr = config.grpc_addr()?;

    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", api_addr, e)))?;
    tracing::info!(addr = %api_addr, "Starting PANTRY REST server");
    let rest = async {
        axum::serve(listener, runtime.router())
            .with_graceful_shutdown(wait_for(shutdown_rx.clone()))
            .await
            .map_err(|e| ApiError::internal_error(format!("REST server error: {}", e)))
    };

    let grpc_listener = tokio::net::TcpListener::bind(grpc_addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", grpc_addr, e)))?;
    tracing::info!(addr = %grpc_addr, "Starting PANTRY gRPC server");
    let grpc = async {
        tonic::transport::Server::builder()
            .add_service(runtime.grpc_service())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(grpc_listener),
                wait_for(shutdown_rx.clone()),
            )
            .await
            .map_err(|e| ApiError::internal_error(format!("gRPC server error: {}", e)))
    };

    let servers = async { tokio::try_join!(rest, grpc).map(|_| ()) };
    tokio::pin!(servers);

    let served = tokio::select! {
        result = &mut servers => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            let _ = shutdown_tx.send(true);
            servers.await
        }
    };
    // Also stops the workers when a server failed on its own.
    let _ = shutdown_tx.send(true);

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Processor worker panicked");
        }
    }
    tracing::info!("PANTRY stopped");
    served
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
