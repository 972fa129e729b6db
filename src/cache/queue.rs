//! Durable, ordered queue of mutations not yet confirmed by the remote store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::blob;
use super::offline::{OfflineCache, PENDING_CHANGES_KEY};
use super::storage::CacheStorage;

/// What a pending change does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
  Create,
  Update,
  Delete,
}

impl fmt::Display for ChangeAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ChangeAction::Create => write!(f, "create"),
      ChangeAction::Update => write!(f, "update"),
      ChangeAction::Delete => write!(f, "delete"),
    }
  }
}

/// A locally queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
  /// Time-ordered UUID, unique per queue
  pub id: String,
  /// Entity kind name (e.g., "status")
  #[serde(rename = "type")]
  pub entity_type: String,
  pub action: ChangeAction,
  /// Full record for create/update, at least `{ "id": .. }` for delete
  pub data: Value,
  pub timestamp: DateTime<Utc>,
  /// `updated_at` of the cached record the change was made against
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base_updated_at: Option<String>,
}

/// Ordered list of pending changes, persisted on every mutation.
pub struct PendingQueue<S: CacheStorage> {
  storage: Arc<S>,
  write_lock: Arc<Mutex<()>>,
}

impl<S: CacheStorage> PendingQueue<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      write_lock: Arc::new(Mutex::new(())),
    }
  }

  /// Queue on the cache's storage, serialized with the cache's writes so
  /// `OfflineCache::clear_all` cannot interleave with an enqueue.
  pub fn for_cache(cache: &OfflineCache<S>) -> Self {
    Self {
      storage: Arc::clone(cache.storage()),
      write_lock: Arc::clone(cache.write_lock()),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, ()>> {
    self
      .write_lock
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn load(&self) -> Result<Vec<PendingChange>> {
    match self.storage.get_item(PENDING_CHANGES_KEY)? {
      Some(raw) => Ok(blob::decode(PENDING_CHANGES_KEY, &raw)?.unwrap_or_default()),
      None => Ok(Vec::new()),
    }
  }

  fn store(&self, changes: &[PendingChange]) -> Result<()> {
    if changes.is_empty() {
      return self.storage.remove_item(PENDING_CHANGES_KEY);
    }
    self
      .storage
      .set_item(PENDING_CHANGES_KEY, &blob::encode(&changes)?)
  }

  /// Append a change and persist the queue.
  pub fn enqueue(
    &self,
    entity_type: &str,
    action: ChangeAction,
    data: Value,
  ) -> Result<PendingChange> {
    self.enqueue_against(entity_type, action, data, None)
  }

  /// Append a change made against a cached record last updated at
  /// `base_updated_at`.
  pub fn enqueue_against(
    &self,
    entity_type: &str,
    action: ChangeAction,
    data: Value,
    base_updated_at: Option<String>,
  ) -> Result<PendingChange> {
    let change = PendingChange {
      id: Uuid::now_v7().to_string(),
      entity_type: entity_type.to_string(),
      action,
      data,
      timestamp: Utc::now(),
      base_updated_at,
    };

    let _guard = self.lock()?;
    let mut changes = self.load()?;
    changes.push(change.clone());
    self.store(&changes)?;

    debug!(
      change_id = %change.id,
      entity_type,
      action = %action,
      queued = changes.len(),
      "Queued pending change"
    );
    Ok(change)
  }

  /// All pending changes in the order they were enqueued.
  pub fn list(&self) -> Result<Vec<PendingChange>> {
    self.load()
  }

  /// Drop a change once the remote store confirmed it.
  pub fn remove(&self, change_id: &str) -> Result<bool> {
    let _guard = self.lock()?;
    let mut changes = self.load()?;
    let before = changes.len();
    changes.retain(|c| c.id != change_id);

    if changes.len() == before {
      return Ok(false);
    }
    self.store(&changes)?;
    Ok(true)
  }

  /// Drop every pending change.
  pub fn clear(&self) -> Result<()> {
    let _guard = self.lock()?;
    self.storage.remove_item(PENDING_CHANGES_KEY)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.load()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::offline::OfflineCache;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::{Cacheable, Collection};
  use proptest::prelude::*;
  use serde_json::json;

  fn queue() -> PendingQueue<MemoryStorage> {
    PendingQueue::new(Arc::new(MemoryStorage::new()))
  }

  #[test]
  fn test_enqueue_assigns_unique_ids() {
    let queue = queue();
    let a = queue
      .enqueue("status", ChangeAction::Create, json!({"id": "s1"}))
      .unwrap();
    let b = queue
      .enqueue("status", ChangeAction::Create, json!({"id": "s2"}))
      .unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(queue.len().unwrap(), 2);
  }

  #[test]
  fn test_remove_unknown_change() {
    let queue = queue();
    queue
      .enqueue("status", ChangeAction::Delete, json!({"id": "s1"}))
      .unwrap();
    assert!(!queue.remove("nope").unwrap());
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[test]
  fn test_clear_drops_everything() {
    let queue = queue();
    queue
      .enqueue("product", ChangeAction::Update, json!({"id": "p1"}))
      .unwrap();
    queue.clear().unwrap();
    assert!(queue.is_empty().unwrap());
  }

  #[test]
  fn test_queue_survives_new_instance() {
    let storage = Arc::new(MemoryStorage::new());
    let first = PendingQueue::new(storage.clone());
    let change = first
      .enqueue_against(
        "status",
        ChangeAction::Update,
        json!({"id": "s1"}),
        Some("2026-01-01T00:00:00Z".into()),
      )
      .unwrap();

    let second = PendingQueue::new(storage);
    assert_eq!(second.list().unwrap(), vec![change]);
  }

  #[test]
  fn test_serialized_shape() {
    let queue = queue();
    let change = queue
      .enqueue("status", ChangeAction::Create, json!({"text": "hi"}))
      .unwrap();
    let value = serde_json::to_value(&change).unwrap();

    assert_eq!(value["type"], "status");
    assert_eq!(value["action"], "create");
    assert!(value.get("base_updated_at").is_none());
  }

  #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
  struct Status {
    id: String,
    mcard_id: String,
    text: String,
  }

  impl Cacheable for Status {
    fn cache_key(&self) -> String {
      self.id.clone()
    }

    fn updated_at(&self) -> Option<&str> {
      None
    }

    fn collection() -> Collection {
      Collection::grouped_by("status", "mcard_id")
    }
  }

  #[test]
  fn test_enqueue_confirm_then_cache() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = PendingQueue::new(storage.clone());
    let cache = OfflineCache::new(storage);

    let change = queue
      .enqueue(
        "status",
        ChangeAction::Create,
        json!({"text": "Back in 5 min"}),
      )
      .unwrap();
    assert_eq!(queue.list().unwrap().len(), 1);

    // Remote store confirmed the insert and assigned an id.
    assert!(queue.remove(&change.id).unwrap());
    assert_eq!(queue.list().unwrap().len(), 0);

    let status = Status {
      id: "s-confirmed".into(),
      mcard_id: "m1".into(),
      text: "Back in 5 min".into(),
    };
    cache.save(&status).unwrap();
    assert_eq!(cache.get::<Status>("s-confirmed").unwrap(), Some(status));
  }

  #[test]
  fn test_enqueue_waits_for_cache_reset() {
    let cache = Arc::new(OfflineCache::new(Arc::new(MemoryStorage::new())));
    let queue = Arc::new(PendingQueue::for_cache(&cache));
    queue
      .enqueue("status", ChangeAction::Create, json!({"id": "s0"}))
      .unwrap();

    let guard = cache.lock().unwrap();
    let writer = {
      let queue = Arc::clone(&queue);
      std::thread::spawn(move || {
        queue
          .enqueue("status", ChangeAction::Create, json!({"id": "s1"}))
          .unwrap();
      })
    };
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(queue.len().unwrap(), 1);
    drop(guard);
    writer.join().unwrap();
    assert_eq!(queue.len().unwrap(), 2);

    cache.clear_all().unwrap();
    assert!(queue.is_empty().unwrap());
  }

  fn action_strategy() -> impl Strategy<Value = ChangeAction> {
    prop_oneof![
      Just(ChangeAction::Create),
      Just(ChangeAction::Update),
      Just(ChangeAction::Delete),
    ]
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_list_preserves_enqueue_order(
      ops in prop::collection::vec(
        (prop::sample::select(vec!["status", "product", "review", "user_card"]), action_strategy()),
        0..24,
      )
    ) {
      let queue = queue();
      let mut expected = Vec::new();
      for (i, (entity_type, action)) in ops.iter().enumerate() {
        let change = queue.enqueue(entity_type, *action, json!({ "seq": i })).unwrap();
        expected.push(change.id);
      }

      let listed: Vec<String> = queue.list().unwrap().into_iter().map(|c| c.id).collect();
      prop_assert_eq!(listed, expected);
    }
  }
}
