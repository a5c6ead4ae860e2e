//! In-process processor counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Processor counters.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    received: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    stale_skipped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`ProcessorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProcessorMetricsSnapshot {
    pub received: u64,
    /// Commands that changed the store.
    pub applied: u64,
    /// Commands that were already in effect (create of an existing id,
    /// delete of an absent one).
    pub duplicates: u64,
    /// Commands overtaken by a later one for the same id.
    pub stale_skipped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}
