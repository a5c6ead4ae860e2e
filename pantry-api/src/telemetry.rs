//! Tracing Subscriber Initialization
//!
//! Structured logs only: there is no span exporter or metrics backend. The
//! filter comes from `RUST_LOG` when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;
use crate::constants::DEFAULT_LOG_FILTER;
use crate::error::{ApiError, ApiResult};

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Service version
    pub service_version: String,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("PANTRY_SERVICE_NAME")
                .unwrap_or_else(|_| "pantry-api".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl TelemetryConfig {
    pub fn with_format(log_format: LogFormat) -> Self {
        Self {
            log_format,
            ..Default::default()
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup, before anything logs.
pub fn init_tracing(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        version = %config.service_version,
        format = ?config.log_format,
        "Tracing initialized"
    );

    Ok(())
}
