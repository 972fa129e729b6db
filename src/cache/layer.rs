//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::offline::OfflineCache;
use super::storage::CacheStorage;
use super::traits::{CacheResult, Cacheable};

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the repositories and the remote store, providing
/// transparent caching with offline fallback.
pub struct CacheLayer<S: CacheStorage> {
  cache: Arc<OfflineCache<S>>,
  /// How long after the last sync cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over the given cache.
  pub fn new(cache: Arc<OfflineCache<S>>) -> Self {
    Self {
      cache,
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn cache(&self) -> &Arc<OfflineCache<S>> {
    &self.cache
  }

  /// Fetch a collection with cache-first strategy.
  ///
  /// 1. If the cache has data and the last sync is fresh, return it
  /// 2. Otherwise fetch from network and replace the cached collection
  /// 3. On network failure, return whatever the cache has (offline mode)
  ///
  /// Cache write failures on the network path are logged and ignored.
  pub async fn fetch_list<T, F, Fut>(
    &self,
    parent: Option<&str>,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let collection = T::collection().name;
    let cached = self.cache.get_all::<T>(parent)?;
    let last_sync = self.cache.last_sync()?;

    if let Some(synced_at) = last_sync {
      if !cached.is_empty() && Utc::now() - synced_at <= self.stale_time {
        return Ok(CacheResult::from_cache(cached, synced_at));
      }
    }

    match fetcher().await {
      Ok(data) => {
        if let Err(e) = self
          .cache
          .replace_all(parent, &data)
          .and_then(|_| self.cache.mark_synced().map(|_| ()))
        {
          warn!(collection, error = %e, "Failed to update offline cache");
        }
        Ok(CacheResult::from_network(data))
      }
      Err(e) if !cached.is_empty() => {
        warn!(
          collection,
          parent,
          error = %e,
          cached = cached.len(),
          "Remote fetch failed, serving offline cache"
        );
        Ok(CacheResult::offline(cached, last_sync))
      }
      Err(e) => Err(e),
    }
  }

  /// Fetch a single entity with the same policy as `fetch_list`.
  pub async fn fetch_one<T, F, Fut>(&self, id: &str, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let collection = T::collection().name;
    let cached = self.cache.get::<T>(id)?;
    let last_sync = self.cache.last_sync()?;

    if let (Some(entity), Some(synced_at)) = (&cached, last_sync) {
      if Utc::now() - synced_at <= self.stale_time {
        return Ok(CacheResult::from_cache(entity.clone(), synced_at));
      }
    }

    match fetcher().await {
      Ok(data) => {
        if let Err(e) = self.cache.save(&data) {
          warn!(collection, id, error = %e, "Failed to update offline cache");
        }
        Ok(CacheResult::from_network(data))
      }
      Err(e) => match cached {
        Some(entity) => {
          warn!(collection, id, error = %e, "Remote fetch failed, serving offline cache");
          Ok(CacheResult::offline(entity, last_sync))
        }
        None => Err(e),
      },
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      stale_time: self.stale_time,
    }
  }
}
