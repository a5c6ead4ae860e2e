//! Service Configuration
//!
//! Everything the binary needs to wire the write and read paths, loaded from
//! `PANTRY_*` environment variables with development defaults. Unparseable
//! numeric values fall back to their defaults; bind addresses are checked when
//! they are resolved.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use pantry_core::RetryConfig;

use crate::constants::{
    DEFAULT_API_BIND, DEFAULT_API_PORT, DEFAULT_BROKER_POLL_INTERVAL_MS, DEFAULT_CACHE_TTL_SECS,
    DEFAULT_CONSUMERS_PER_QUEUE, DEFAULT_GRPC_PORT, DEFAULT_LMDB_MAX_SIZE_MB,
    DEFAULT_QUERY_TIMEOUT_MS,
};
use crate::error::{ApiError, ApiResult};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Runtime configuration for the PANTRY service.
#[derive(Debug, Clone)]
pub struct PantryConfig {
    // ========================================================================
    // Network
    // ========================================================================
    pub api_bind: String,
    pub api_port: String,
    pub grpc_port: String,

    // ========================================================================
    // Read path
    // ========================================================================
    /// Remote `EntityQuery` endpoint. `None` serves queries in-process.
    pub query_endpoint: Option<String>,
    pub query_timeout: Duration,
    pub cache_ttl: Duration,

    // ========================================================================
    // Storage
    // ========================================================================
    /// Root of the LMDB environments. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub lmdb_max_size_mb: usize,

    // ========================================================================
    // Processor
    // ========================================================================
    pub consumers_per_queue: usize,
    pub retry: RetryConfig,
    pub broker_poll_interval: Duration,

    pub log_format: LogFormat,
}

impl Default for PantryConfig {
    fn default() -> Self {
        Self {
            api_bind: DEFAULT_API_BIND.to_string(),
            api_port: DEFAULT_API_PORT.to_string(),
            grpc_port: DEFAULT_GRPC_PORT.to_string(),
            query_endpoint: None,
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            data_dir: None,
            lmdb_max_size_mb: DEFAULT_LMDB_MAX_SIZE_MB,
            consumers_per_queue: DEFAULT_CONSUMERS_PER_QUEUE,
            retry: RetryConfig::default(),
            broker_poll_interval: Duration::from_millis(DEFAULT_BROKER_POLL_INTERVAL_MS),
            log_format: LogFormat::default(),
        }
    }
}

impl PantryConfig {
    /// Create PantryConfig from environment variables.
    ///
    /// Environment variables:
    /// - `PANTRY_API_BIND`: REST bind host (default: 0.0.0.0)
    /// - `PORT` or `PANTRY_API_PORT`: REST port (default: 3000)
    /// - `PANTRY_GRPC_PORT`: gRPC port (default: 50051)
    /// - `PANTRY_QUERY_ENDPOINT`: remote query service, e.g. "http://query:50051"
    /// - `PANTRY_QUERY_TIMEOUT_MS`: query call bound (default: 2000)
    /// - `PANTRY_CACHE_TTL_SECS`: cache entry TTL (default: 600)
    /// - `PANTRY_DATA_DIR`: LMDB root; unset keeps everything in memory
    /// - `PANTRY_LMDB_MAX_SIZE_MB`: map size per environment (default: 256)
    /// - `PANTRY_CONSUMERS_PER_QUEUE`: workers per queue (default: 2)
    /// - `PANTRY_RETRY_MAX_ATTEMPTS`: apply attempts before dead-lettering (default: 5)
    /// - `PANTRY_RETRY_INITIAL_BACKOFF_MS` / `PANTRY_RETRY_MAX_BACKOFF_MS` /
    ///   `PANTRY_RETRY_MULTIPLIER`: backoff schedule (default: 100 / 5000 / 2.0)
    /// - `PANTRY_BROKER_POLL_INTERVAL_MS`: durable broker poll (default: 200)
    /// - `PANTRY_LOG_FORMAT`: "json" or "pretty" (default: pretty)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_u64 = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let non_empty = |key: &str| lookup(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        let retry = RetryConfig {
            max_attempts: lookup("PANTRY_RETRY_MAX_ATTEMPTS")
                .and_then(|s| s.trim().parse::<u32>().ok())
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.retry.max_attempts),
            initial_backoff: parse_u64("PANTRY_RETRY_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_backoff),
            max_backoff: parse_u64("PANTRY_RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_backoff),
            backoff_multiplier: lookup("PANTRY_RETRY_MULTIPLIER")
                .and_then(|s| s.trim().parse::<f32>().ok())
                .filter(|m| m.is_finite() && *m >= 1.0)
                .unwrap_or(defaults.retry.backoff_multiplier),
        };

        let log_format = match lookup("PANTRY_LOG_FORMAT").map(|s| s.trim().to_lowercase()) {
            Some(format) if format == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            api_bind: non_empty("PANTRY_API_BIND").unwrap_or(defaults.api_bind),
            api_port: non_empty("PORT")
                .or_else(|| non_empty("PANTRY_API_PORT"))
                .unwrap_or(defaults.api_port),
            grpc_port: non_empty("PANTRY_GRPC_PORT").unwrap_or(defaults.grpc_port),
            query_endpoint: non_empty("PANTRY_QUERY_ENDPOINT"),
            query_timeout: parse_u64("PANTRY_QUERY_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.query_timeout),
            cache_ttl: parse_u64("PANTRY_CACHE_TTL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            data_dir: non_empty("PANTRY_DATA_DIR").map(PathBuf::from),
            lmdb_max_size_mb: lookup("PANTRY_LMDB_MAX_SIZE_MB")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|mb| *mb > 0)
                .unwrap_or(defaults.lmdb_max_size_mb),
            consumers_per_queue: lookup("PANTRY_CONSUMERS_PER_QUEUE")
                .and_then(|s| s.trim().parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.consumers_per_queue),
            retry,
            broker_poll_interval: parse_u64("PANTRY_BROKER_POLL_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.broker_poll_interval),
            log_format,
        }
    }

    /// Address the REST server binds to.
    pub fn api_addr(&self) -> ApiResult<SocketAddr> {
        resolve_addr(&self.api_bind, &self.api_port)
    }

    /// Address the gRPC server binds to.
    pub fn grpc_addr(&self) -> ApiResult<SocketAddr> {
        resolve_addr(&self.api_bind, &self.grpc_port)
    }

    /// Whether state survives a restart.
    pub fn is_durable(&self) -> bool {
        self.data_dir.is_some()
    }
}

fn resolve_addr(host: &str, port: &str) -> ApiResult<SocketAddr> {
    let port = port
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", port)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
