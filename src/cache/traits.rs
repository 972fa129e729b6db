//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Column every cached record is keyed by.
pub const ID_COLUMN: &str = "id";

/// Describes how a kind of record is laid out in the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collection {
  /// Storage name (e.g., "status", "mcard")
  pub name: &'static str,
  /// Records are grouped by this column's value when set
  pub parent_column: Option<&'static str>,
  /// Column looked up by `get_by_secondary_key`
  pub secondary_column: Option<&'static str>,
}

impl Collection {
  pub const fn flat(name: &'static str) -> Self {
    Self {
      name,
      parent_column: None,
      secondary_column: None,
    }
  }

  pub const fn grouped_by(name: &'static str, parent_column: &'static str) -> Self {
    Self {
      name,
      parent_column: Some(parent_column),
      secondary_column: None,
    }
  }

  pub const fn with_secondary(mut self, column: &'static str) -> Self {
    self.secondary_column = Some(column);
    self
  }

  pub fn is_grouped(&self) -> bool {
    self.parent_column.is_some()
  }
}

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key (their `id`) and optionally an
/// updated_at timestamp used for conflict detection on replay.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (the record's `id` column)
  fn cache_key(&self) -> String;

  /// Last modification timestamp (ISO 8601).
  /// Returns None if the entity doesn't track modification time.
  fn updated_at(&self) -> Option<&str>;

  /// Collection this entity is stored in
  fn collection() -> Collection;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last reconciled with the remote store (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Offline mode - remote store unavailable, serving cached data
  Offline,
}
