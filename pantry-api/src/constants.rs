//! Constants for PANTRY API
//!
//! This module contains all constant values used throughout the API.
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// SERVER
// ============================================================================

/// Default bind host for the REST server
pub const DEFAULT_API_BIND: &str = "0.0.0.0";

/// Default REST port
pub const DEFAULT_API_PORT: u16 = 3000;

/// Default gRPC port
pub const DEFAULT_GRPC_PORT: u16 = 50051;

// ============================================================================
// READ PATH
// ============================================================================

/// Bound on a single query service call (2 seconds)
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2000;

/// TTL of `entity:all` and `entity:<id>` cache entries (10 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 600;

// ============================================================================
// STORAGE
// ============================================================================

/// Default LMDB map size per environment in megabytes
pub const DEFAULT_LMDB_MAX_SIZE_MB: usize = 256;

/// Subdirectory names under `PANTRY_DATA_DIR`
pub const STORE_DIR: &str = "store";
pub const BROKER_DIR: &str = "broker";
pub const CACHE_DIR: &str = "cache";

// ============================================================================
// PROCESSOR
// ============================================================================

/// Concurrent consumers started per queue
pub const DEFAULT_CONSUMERS_PER_QUEUE: usize = 2;

/// How often a durable broker consumer re-checks an empty queue
pub const DEFAULT_BROKER_POLL_INTERVAL_MS: u64 = 200;

/// Attempts the cache invalidator makes after a committed apply
pub const CACHE_INVALIDATION_ATTEMPTS: u32 = 3;

/// Pause between cache invalidation attempts
pub const CACHE_INVALIDATION_BACKOFF_MS: u64 = 50;

// ============================================================================
// LOGGING
// ============================================================================

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "pantry_api=debug,tower_http=debug,info";
