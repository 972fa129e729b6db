//! Local persistent cache of remote entities.
//!
//! Each collection is one JSON blob in the storage medium. Flat collections
//! are stored as an array of records; grouped collections as an object of
//! `parent id -> array of records`. Every operation reads the blob, works on
//! the deserialized records and, for writes, persists immediately.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::blob;
use super::storage::CacheStorage;
use super::traits::{Cacheable, Collection, ID_COLUMN};

/// Prefix shared by every key this crate writes.
pub const KEY_PREFIX: &str = "finderid:";
/// Key holding the pending-change queue.
pub const PENDING_CHANGES_KEY: &str = "finderid:pending_changes";
/// Key holding the last successful reconciliation time.
pub const LAST_SYNC_KEY: &str = "finderid:last_sync";

const FLAT_GROUP: &str = "";

/// Storage key for a collection.
pub fn collection_key(name: &str) -> String {
  format!("{}entities:{}", KEY_PREFIX, name)
}

/// Text value of `column` in a JSON record. Numeric ids are stringified.
pub fn column_text(record: &Value, column: &str) -> Option<String> {
  match record.get(column)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// The `id` of a JSON record.
pub fn record_id(record: &Value) -> Option<String> {
  column_text(record, ID_COLUMN)
}

/// In-memory view of one collection blob.
struct Shelf {
  collection: Collection,
  groups: BTreeMap<String, Vec<Value>>,
}

impl Shelf {
  /// Insert or replace `record` under `group`, dropping any copy of the same id
  /// held by another group.
  fn upsert(&mut self, group: String, id: &str, record: Value) {
    for (name, records) in self.groups.iter_mut() {
      if *name != group {
        records.retain(|r| record_id(r).as_deref() != Some(id));
      }
    }

    let records = self.groups.entry(group).or_default();
    match records
      .iter_mut()
      .find(|r| record_id(r).as_deref() == Some(id))
    {
      Some(existing) => *existing = record,
      None => records.push(record),
    }
  }

  fn remove(&mut self, id: &str) -> bool {
    let mut removed = false;
    for records in self.groups.values_mut() {
      let before = records.len();
      records.retain(|r| record_id(r).as_deref() != Some(id));
      removed |= records.len() != before;
    }
    removed
  }

  fn iter(&self) -> impl Iterator<Item = &Value> {
    self.groups.values().flatten()
  }
}

/// Synchronous, best-effort cache of denormalized remote entities.
///
/// Not a source of truth: nothing here is guaranteed fresh relative to the
/// remote store. Storage failures are returned to the caller.
pub struct OfflineCache<S: CacheStorage> {
  storage: Arc<S>,
  write_lock: Arc<Mutex<()>>,
}

impl<S: CacheStorage> OfflineCache<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  /// Lock shared with queues built by `PendingQueue::for_cache`.
  pub(crate) fn write_lock(&self) -> &Arc<Mutex<()>> {
    &self.write_lock
  }

  /// The storage medium this cache writes to.
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub(super) fn lock(&self) -> Result<MutexGuard<'_, ()>> {
    self
      .write_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn load(&self, collection: Collection) -> Result<Shelf> {
    let key = collection_key(collection.name);

    let groups = match self.storage.get_item(&key)? {
      None => BTreeMap::new(),
      Some(raw) if collection.is_grouped() => {
        blob::decode::<BTreeMap<String, Vec<Value>>>(&key, &raw)?.unwrap_or_default()
      }
      Some(raw) => blob::decode::<Vec<Value>>(&key, &raw)?
        .map(|records| BTreeMap::from([(FLAT_GROUP.to_string(), records)]))
        .unwrap_or_default(),
    };

    Ok(Shelf { collection, groups })
  }

  fn store(&self, mut shelf: Shelf) -> Result<()> {
    let key = collection_key(shelf.collection.name);
    shelf.groups.retain(|_, records| !records.is_empty());

    let raw = if shelf.collection.is_grouped() {
      blob::encode(&shelf.groups)?
    } else {
      let records: Vec<&Value> = shelf.iter().collect();
      blob::encode(&records)?
    };

    self.storage.set_item(&key, &raw)
  }

  /// Group and id a record is stored under.
  fn placement(collection: Collection, record: &Value) -> Result<(String, String)> {
    let id = record_id(record)
      .ok_or_else(|| eyre!("Cannot cache {} record without an id", collection.name))?;

    let group = match collection.parent_column {
      Some(column) => column_text(record, column).ok_or_else(|| {
        eyre!(
          "Cannot cache {} record {} without {}",
          collection.name,
          id,
          column
        )
      })?,
      None => FLAT_GROUP.to_string(),
    };

    Ok((group, id))
  }

  // ==========================================================================
  // Raw record operations
  // ==========================================================================

  /// Insert or replace a record by its `id`.
  pub fn save_record(&self, collection: Collection, record: Value) -> Result<()> {
    let (group, id) = Self::placement(collection, &record)?;

    let _guard = self.lock()?;
    let mut shelf = self.load(collection)?;
    shelf.upsert(group, &id, record);
    self.store(shelf)
  }

  /// Find a record by `id`.
  pub fn get_record(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
    let shelf = self.load(collection)?;
    let found = shelf
      .iter()
      .find(|r| record_id(r).as_deref() == Some(id))
      .cloned();
    Ok(found)
  }

  /// Find the first record whose `column` equals `value`.
  pub fn find_record(
    &self,
    collection: Collection,
    column: &str,
    value: &str,
  ) -> Result<Option<Value>> {
    let shelf = self.load(collection)?;
    let found = shelf
      .iter()
      .find(|r| column_text(r, column).as_deref() == Some(value))
      .cloned();
    Ok(found)
  }

  /// All records, or the records grouped under `parent` for grouped
  /// collections. Flat collections ignore `parent`.
  pub fn records(&self, collection: Collection, parent: Option<&str>) -> Result<Vec<Value>> {
    let shelf = self.load(collection)?;

    match parent {
      Some(parent) if collection.is_grouped() => {
        Ok(shelf.groups.get(parent).cloned().unwrap_or_default())
      }
      _ => Ok(shelf.iter().cloned().collect()),
    }
  }

  /// Replace the records under `parent` (or the whole collection) with a
  /// fresh snapshot.
  pub fn replace_records(
    &self,
    collection: Collection,
    parent: Option<&str>,
    records: Vec<Value>,
  ) -> Result<()> {
    let _guard = self.lock()?;
    let mut shelf = self.load(collection)?;

    match parent {
      Some(parent) if collection.is_grouped() => {
        shelf.groups.remove(parent);
        for record in records {
          let id = record_id(&record)
            .ok_or_else(|| eyre!("Cannot cache {} record without an id", collection.name))?;
          shelf.upsert(parent.to_string(), &id, record);
        }
      }
      _ => {
        shelf.groups.clear();
        for record in records {
          let (group, id) = Self::placement(collection, &record)?;
          shelf.upsert(group, &id, record);
        }
      }
    }

    self.store(shelf)
  }

  /// Remove a record. Dependent collections are left untouched.
  pub fn delete_record(&self, collection: Collection, id: &str) -> Result<bool> {
    let _guard = self.lock()?;
    let mut shelf = self.load(collection)?;
    let removed = shelf.remove(id);
    if removed {
      self.store(shelf)?;
    }
    Ok(removed)
  }

  /// Wipe every collection, the pending queue and the last-sync marker.
  ///
  /// Holds the write lock shared with `PendingQueue::for_cache` queues, so
  /// a concurrent enqueue lands either before the wipe or after it. Queues
  /// built with `PendingQueue::new` on the same storage must not write
  /// while this runs.
  pub fn clear_all(&self) -> Result<()> {
    let _guard = self.lock()?;
    let keys = self.storage.keys_with_prefix(KEY_PREFIX)?;
    for key in &keys {
      self.storage.remove_item(key)?;
    }
    info!(keys = keys.len(), "Cleared offline cache");
    Ok(())
  }

  // ==========================================================================
  // Typed operations
  // ==========================================================================

  /// Insert or replace `entity` by its cache key.
  pub fn save<T: Cacheable>(&self, entity: &T) -> Result<()> {
    self.save_record(T::collection(), to_record(entity)?)
  }

  /// Get a cached entity by id.
  pub fn get<T: Cacheable>(&self, id: &str) -> Result<Option<T>> {
    self
      .get_record(T::collection(), id)?
      .map(from_record)
      .transpose()
  }

  /// Get a cached entity by its collection's secondary key.
  pub fn get_by_secondary_key<T: Cacheable>(&self, key: &str) -> Result<Option<T>> {
    let collection = T::collection();
    let column = collection
      .secondary_column
      .ok_or_else(|| eyre!("{} records have no secondary key", collection.name))?;

    self
      .find_record(collection, column, key)?
      .map(from_record)
      .transpose()
  }

  /// All cached entities, or those under `parent` for grouped collections.
  /// An unknown parent yields an empty list.
  pub fn get_all<T: Cacheable>(&self, parent: Option<&str>) -> Result<Vec<T>> {
    self
      .records(T::collection(), parent)?
      .into_iter()
      .map(from_record)
      .collect()
  }

  /// Replace cached entities under `parent` (or all of them).
  pub fn replace_all<T: Cacheable>(&self, parent: Option<&str>, entities: &[T]) -> Result<()> {
    let records = entities.iter().map(to_record).collect::<Result<Vec<_>>>()?;
    self.replace_records(T::collection(), parent, records)
  }

  /// Remove a cached entity by id.
  pub fn delete<T: Cacheable>(&self, id: &str) -> Result<bool> {
    self.delete_record(T::collection(), id)
  }

  // ==========================================================================
  // Last-sync marker
  // ==========================================================================

  /// When the cache was last reconciled with the remote store.
  pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    match self.storage.get_item(LAST_SYNC_KEY)? {
      Some(raw) => blob::decode(LAST_SYNC_KEY, &raw),
      None => Ok(None),
    }
  }

  /// Record a successful reconciliation now.
  pub fn mark_synced(&self) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    self.mark_synced_at(now)?;
    Ok(now)
  }

  pub fn mark_synced_at(&self, at: DateTime<Utc>) -> Result<()> {
    debug!(at = %at, "Marking cache synced");
    self.storage.set_item(LAST_SYNC_KEY, &blob::encode(&at)?)
  }

  /// True when the cache was never synced or was synced longer than
  /// `stale_time` ago.
  pub fn is_stale(&self, stale_time: Duration) -> Result<bool> {
    Ok(match self.last_sync()? {
      Some(at) => Utc::now() - at > stale_time,
      None => true,
    })
  }
}

fn to_record<T: Cacheable>(entity: &T) -> Result<Value> {
  serde_json::to_value(entity).map_err(|e| {
    eyre!(
      "Failed to serialize {} {}: {}",
      T::collection().name,
      entity.cache_key(),
      e
    )
  })
}

fn from_record<T: Cacheable>(record: Value) -> Result<T> {
  serde_json::from_value(record)
    .map_err(|e| eyre!("Failed to deserialize {} record: {}", T::collection().name, e))
}
