//! Local persistence for offline support.
//!
//! This module is entity-agnostic:
//! - Caches JSON records keyed by `id`, flat or grouped by a parent column
//! - Queues mutations the remote store has not confirmed yet
//! - Tracks the last successful reconciliation with the remote store
//! - Serves stale cache when the network is unavailable

pub mod blob;
mod layer;
mod offline;
mod queue;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use offline::{
  collection_key, column_text, record_id, OfflineCache, KEY_PREFIX, LAST_SYNC_KEY,
  PENDING_CHANGES_KEY,
};
pub use queue::{ChangeAction, PendingChange, PendingQueue};
pub use storage::{CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable, Collection, ID_COLUMN};
