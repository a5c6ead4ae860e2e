//! Read cache for the query path.
//!
//! Two logical keys exist: `entity:all` for the full listing and
//! `entity:<id>` per entity, both with a TTL. The cache is disposable; a miss
//! always falls through to the query service and absence is never treated
//! as "not found".
//!
//! # Invalidation
//!
//! - `entity:all` is evicted eagerly when a mutation is submitted.
//! - `entity:<id>` is overwritten or evicted only after the processor has
//!   applied the mutation.
//!
//! Every apply records a change in the [`ChangeJournal`] before touching the
//! cache, and every entry is stored stamped with the watermark it was written
//! under. A read whose stamp no longer matches the journal is a miss, so an
//! entry that an apply failed to overwrite or evict is never served. A reader
//! that populates the cache after a miss also compares watermarks before and
//! after its write and evicts its own entry if a change slipped in.

mod journal;
mod key;
mod lmdb_backend;
mod memory_backend;
mod payload;
mod read_cache;
mod traits;

pub use journal::{ChangeJournal, InMemoryChangeJournal, Watermark};
pub use key::CacheKey;
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory_backend::InMemoryCacheBackend;
pub use payload::{CachedEntity, CachedListing, Stamped};
pub use read_cache::{PopulateOutcome, ReadCache};
pub use traits::{CacheBackend, CacheStats};
