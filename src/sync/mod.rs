//! Glue between the offline cache, the pending queue and the remote store.

mod replay;
mod repository;

pub use replay::{replay, Conflict, Rejection, ReplayReport};
pub use repository::{list_selection, Repository, WriteOutcome};

use chrono::Duration;
use color_eyre::Result;
use std::sync::Arc;

use crate::cache::{CacheLayer, CacheStorage, OfflineCache, PendingQueue};
use crate::domain::Entity;
use crate::remote::RemoteStore;

/// Shared handles every repository and replay needs.
pub struct SyncContext<S: CacheStorage> {
  pub cache: Arc<OfflineCache<S>>,
  pub queue: Arc<PendingQueue<S>>,
  pub remote: Arc<dyn RemoteStore>,
  stale_time: Duration,
}

impl<S: CacheStorage> SyncContext<S> {
  pub fn new(storage: Arc<S>, remote: Arc<dyn RemoteStore>) -> Self {
    let cache = OfflineCache::new(storage);
    let queue = PendingQueue::for_cache(&cache);
    Self {
      cache: Arc::new(cache),
      queue: Arc::new(queue),
      remote,
      stale_time: Duration::minutes(5),
    }
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn repository<T: Entity>(&self) -> Repository<T, S> {
    Repository::new(
      Arc::clone(&self.remote),
      CacheLayer::new(Arc::clone(&self.cache)).with_stale_time(self.stale_time),
      Arc::clone(&self.queue),
    )
  }

  /// Replay the pending queue now.
  pub async fn replay(&self) -> Result<ReplayReport> {
    replay(&self.queue, &self.cache, self.remote.as_ref()).await
  }
}
