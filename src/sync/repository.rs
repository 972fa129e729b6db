//! Per-entity data access with offline fallback.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{
  CacheLayer, CacheResult, CacheStorage, ChangeAction, OfflineCache, PendingChange, PendingQueue,
};
use crate::domain::{Entity, EntityKind};
use crate::remote::{from_row, from_rows, is_rejection, to_row, RemoteStore, Selection};

/// Columns the remote store owns and never takes from a patch.
const SERVER_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

/// Row to insert: unset columns are left to remote defaults.
pub(crate) fn insert_payload(row: Value) -> Value {
  match row {
    Value::Object(mut fields) => {
      fields.retain(|_, value| !value.is_null());
      Value::Object(fields)
    }
    other => other,
  }
}

/// Patch for an update: every column except the server-owned ones.
pub(crate) fn patch_payload(row: Value) -> Value {
  match row {
    Value::Object(mut fields) => {
      for column in SERVER_COLUMNS {
        fields.remove(column);
      }
      Value::Object(fields)
    }
    other => other,
  }
}

/// Remote selection listing `kind`, narrowed to one parent's group when the
/// kind is grouped.
pub fn list_selection(kind: EntityKind, parent: Option<&str>) -> Selection {
  let mut selection = Selection::from(kind.table());
  if let (Some(column), Some(parent)) = (kind.collection().parent_column, parent) {
    selection = selection.eq(column, parent);
  }
  if let Some(column) = kind.ordered_by() {
    selection = selection.order_by(column, false);
  }
  selection
}

/// Whether a write reached the remote store or waits in the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
  /// The remote store accepted the write; holds the stored value
  Confirmed(T),
  /// Applied to the cache only, replayed later
  Queued { entity: T, change: PendingChange },
}

impl<T> WriteOutcome<T> {
  pub fn entity(&self) -> &T {
    match self {
      WriteOutcome::Confirmed(entity) => entity,
      WriteOutcome::Queued { entity, .. } => entity,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued { .. })
  }
}

/// Fetch and mutate one entity kind through the cache.
///
/// Writes go to the remote store first. When that fails transiently, or when
/// older changes are still queued, the write is applied to the cache and
/// queued so replay keeps the original order. A rejected write is returned
/// as an error and leaves cache and queue untouched.
pub struct Repository<T: Entity, S: CacheStorage> {
  remote: Arc<dyn RemoteStore>,
  layer: CacheLayer<S>,
  queue: Arc<PendingQueue<S>>,
  _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: CacheStorage> Repository<T, S> {
  pub fn new(remote: Arc<dyn RemoteStore>, layer: CacheLayer<S>, queue: Arc<PendingQueue<S>>) -> Self {
    Self {
      remote,
      layer,
      queue,
      _entity: PhantomData,
    }
  }

  fn cache(&self) -> &OfflineCache<S> {
    self.layer.cache()
  }

  fn table(&self) -> &'static str {
    T::KIND.table()
  }

  /// Remote selection for a whole collection or one parent's group.
  pub fn selection(parent: Option<&str>) -> Selection {
    list_selection(T::KIND, parent)
  }

  /// The collection, or one parent's group for grouped kinds.
  pub async fn fetch_list(&self, parent: Option<&str>) -> Result<CacheResult<Vec<T>>> {
    let parent = parent.filter(|_| T::collection().is_grouped());
    let selection = Self::selection(parent);
    let table = self.table();

    self
      .layer
      .fetch_list(parent, || async move {
        from_rows(table, self.remote.select(&selection).await?)
      })
      .await
  }

  pub async fn fetch_one(&self, id: &str) -> Result<CacheResult<T>> {
    let table = self.table();
    self
      .layer
      .fetch_one(id, || async move {
        match self.remote.get(table, id).await? {
          Some(row) => from_row(table, row),
          None => Err(eyre!("No {} with id {}", T::KIND, id)),
        }
      })
      .await
  }

  /// Look up by the kind's secondary key (slug, card number).
  pub async fn fetch_by_secondary_key(&self, key: &str) -> Result<Option<CacheResult<T>>> {
    let column = T::collection()
      .secondary_column
      .ok_or_else(|| eyre!("{} has no secondary key", T::KIND))?;
    let selection = Selection::from(self.table()).eq(column, key).limit(1);

    match self.remote.select(&selection).await {
      Ok(rows) => {
        let Some(row) = rows.into_iter().next() else {
          return Ok(None);
        };
        let entity: T = from_row(self.table(), row)?;
        if let Err(e) = self.cache().save(&entity) {
          warn!(kind = %T::KIND, error = %e, "Failed to update offline cache");
        }
        Ok(Some(CacheResult::from_network(entity)))
      }
      Err(e) => match self.cache().get_by_secondary_key::<T>(key)? {
        Some(entity) => {
          warn!(kind = %T::KIND, key, error = %e, "Remote lookup failed, serving offline cache");
          Ok(Some(CacheResult::offline(entity, self.cache().last_sync()?)))
        }
        None => Err(e),
      },
    }
  }

  fn must_queue(&self) -> Result<bool> {
    let pending = self.queue.len()?;
    if pending > 0 {
      debug!(kind = %T::KIND, pending, "Earlier changes still queued");
    }
    Ok(pending > 0)
  }

  fn queue_change(
    &self,
    action: ChangeAction,
    data: Value,
    base_updated_at: Option<String>,
  ) -> Result<PendingChange> {
    self
      .queue
      .enqueue_against(T::KIND.as_str(), action, data, base_updated_at)
  }

  pub async fn create(&self, entity: T) -> Result<WriteOutcome<T>> {
    let row = to_row(self.table(), &entity)?;

    if !self.must_queue()? {
      match self.remote.insert(self.table(), insert_payload(row.clone())).await {
        Ok(stored) => {
          let stored: T = from_row(self.table(), stored)?;
          self.cache().save(&stored)?;
          return Ok(WriteOutcome::Confirmed(stored));
        }
        Err(e) if is_rejection(&e) => return Err(e),
        Err(e) => warn!(kind = %T::KIND, id = %entity.cache_key(), error = %e, "Create failed, queueing"),
      }
    }

    self.cache().save(&entity)?;
    let change = self.queue_change(ChangeAction::Create, row, None)?;
    Ok(WriteOutcome::Queued { entity, change })
  }

  /// Update with the entity as the caller last saw it. Its `updated_at` is
  /// the version replay checks the remote row against.
  pub async fn update(&self, entity: T) -> Result<WriteOutcome<T>> {
    let id = entity.cache_key();
    let row = to_row(self.table(), &entity)?;
    let base = match entity.updated_at() {
      Some(at) => Some(at.to_string()),
      None => self
        .cache()
        .get::<T>(&id)?
        .and_then(|cached| cached.updated_at().map(String::from)),
    };

    if !self.must_queue()? {
      match self
        .remote
        .update(self.table(), &id, patch_payload(row.clone()))
        .await
      {
        Ok(stored) => {
          let stored: T = from_row(self.table(), stored)?;
          self.cache().save(&stored)?;
          return Ok(WriteOutcome::Confirmed(stored));
        }
        Err(e) if is_rejection(&e) => return Err(e),
        Err(e) => warn!(kind = %T::KIND, id = %id, error = %e, "Update failed, queueing"),
      }
    }

    self.cache().save(&entity)?;
    let change = self.queue_change(ChangeAction::Update, row, base)?;
    Ok(WriteOutcome::Queued { entity, change })
  }

  pub async fn delete(&self, id: &str) -> Result<WriteOutcome<String>> {
    let base = self
      .cache()
      .get::<T>(id)?
      .and_then(|cached| cached.updated_at().map(String::from));

    if !self.must_queue()? {
      match self.remote.delete(self.table(), id).await {
        Ok(()) => {
          self.cache().delete::<T>(id)?;
          return Ok(WriteOutcome::Confirmed(id.to_string()));
        }
        Err(e) if is_rejection(&e) => return Err(e),
        Err(e) => warn!(kind = %T::KIND, id, error = %e, "Delete failed, queueing"),
      }
    }

    self.cache().delete::<T>(id)?;
    let change = self.queue_change(ChangeAction::Delete, json!({ "id": id }), base)?;
    Ok(WriteOutcome::Queued {
      entity: id.to_string(),
      change,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::domain::{McardReview, McardStatus};
  use crate::remote::MemoryRemote;

  struct Fixture {
    remote: Arc<MemoryRemote>,
    cache: Arc<OfflineCache<MemoryStorage>>,
    queue: Arc<PendingQueue<MemoryStorage>>,
  }

  impl Fixture {
    fn new() -> Self {
      let cache = OfflineCache::new(Arc::new(MemoryStorage::new()));
      let queue = PendingQueue::for_cache(&cache);
      Self {
        remote: Arc::new(MemoryRemote::new()),
        cache: Arc::new(cache),
        queue: Arc::new(queue),
      }
    }

    fn repo<T: Entity>(&self) -> Repository<T, MemoryStorage> {
      Repository::new(
        self.remote.clone(),
        CacheLayer::new(Arc::clone(&self.cache)),
        Arc::clone(&self.queue),
      )
    }
  }

  fn status(id: &str, mcard: &str, text: &str) -> McardStatus {
    McardStatus {
      id: id.into(),
      mcard_id: mcard.into(),
      status_text: text.into(),
      status_color: None,
      is_active: true,
      expires_at: None,
      created_at: None,
      updated_at: None,
    }
  }

  #[test]
  fn test_payloads() {
    let row = json!({"id": "s1", "status_text": "hi", "expires_at": null, "updated_at": "x"});
    assert_eq!(
      insert_payload(row.clone()),
      json!({"id": "s1", "status_text": "hi", "updated_at": "x"})
    );
    assert_eq!(
      patch_payload(row),
      json!({"status_text": "hi", "expires_at": null})
    );
  }

  #[test]
  fn test_selection_scopes_and_orders() {
    let selection = Repository::<McardStatus, MemoryStorage>::selection(Some("m1"));
    assert_eq!(selection.table, "mcard_statuses");
    assert_eq!(selection.filters, vec![("mcard_id".to_string(), "m1".to_string())]);
    assert_eq!(selection.order.map(|o| o.ascending), Some(false));
  }

  #[tokio::test]
  async fn test_fetch_list_falls_back_offline() {
    let fx = Fixture::new();
    fx.remote
      .seed(
        "mcard_reviews",
        vec![json!({"id": "r1", "mcard_id": "m1", "reviewer_name": "Ana", "rating": 5})],
      )
      .unwrap();
    let repo = fx.repo::<McardReview>();

    let online = repo.fetch_list(Some("m1")).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);
    assert_eq!(online.data.len(), 1);

    // Make the cache stale so the remote is tried again.
    fx.cache
      .mark_synced_at(chrono::Utc::now() - chrono::Duration::hours(1))
      .unwrap();
    fx.remote.set_offline(true);

    let offline = repo.fetch_list(Some("m1")).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data, online.data);

    assert!(repo.fetch_list(Some("m2")).await.is_err());
  }

  #[tokio::test]
  async fn test_offline_create_is_queued_and_cached() {
    let fx = Fixture::new();
    fx.remote.set_offline(true);
    let repo = fx.repo::<McardStatus>();

    let outcome = repo.create(status("s1", "m1", "Lunch")).await.unwrap();
    assert!(outcome.is_queued());
    assert_eq!(fx.queue.len().unwrap(), 1);
    assert_eq!(
      fx.cache.get::<McardStatus>("s1").unwrap().map(|s| s.status_text),
      Some("Lunch".to_string())
    );

    // Later writes wait behind the queued one even once back online.
    fx.remote.set_offline(false);
    let second = repo.create(status("s2", "m1", "Back")).await.unwrap();
    assert!(second.is_queued());
    assert!(fx.remote.rows("mcard_statuses").is_empty());
  }

  #[tokio::test]
  async fn test_online_writes_are_confirmed() {
    let fx = Fixture::new();
    let repo = fx.repo::<McardStatus>();

    let created = repo.create(status("s1", "m1", "Open")).await.unwrap();
    let WriteOutcome::Confirmed(stored) = created else {
      panic!("expected confirmed create");
    };
    assert!(stored.updated_at.is_some());

    let mut edited = stored.clone();
    edited.status_text = "Closed".into();
    let updated = repo.update(edited).await.unwrap();
    assert_eq!(updated.entity().status_text, "Closed");
    assert!(!updated.is_queued());

    let deleted = repo.delete("s1").await.unwrap();
    assert_eq!(deleted, WriteOutcome::Confirmed("s1".to_string()));
    assert!(fx.cache.get::<McardStatus>("s1").unwrap().is_none());
    assert!(fx.remote.rows("mcard_statuses").is_empty());
  }

  #[tokio::test]
  async fn test_rejected_write_is_not_queued() {
    let fx = Fixture::new();
    fx.remote
      .seed("mcard_statuses", vec![json!({"id": "s1", "mcard_id": "m1", "status_text": "x"})])
      .unwrap();
    let repo = fx.repo::<McardStatus>();

    let err = repo.create(status("s1", "m1", "dup")).await.unwrap_err();
    assert!(is_rejection(&err));
    assert!(fx.queue.is_empty().unwrap());
    assert!(fx.cache.get::<McardStatus>("s1").unwrap().is_none());

    // The next write still goes straight to the remote.
    let outcome = repo.create(status("s2", "m1", "fresh")).await.unwrap();
    assert!(!outcome.is_queued());
    assert_eq!(fx.remote.rows("mcard_statuses").len(), 2);
  }

  #[tokio::test]
  async fn test_offline_update_records_base_version() {
    let fx = Fixture::new();
    let repo = fx.repo::<McardStatus>();
    let WriteOutcome::Confirmed(stored) = repo.create(status("s1", "m1", "Open")).await.unwrap()
    else {
      panic!("expected confirmed create");
    };

    fx.remote.set_offline(true);
    let mut edited = stored.clone();
    edited.status_text = "Closed".into();
    let WriteOutcome::Queued { change, .. } = repo.update(edited).await.unwrap() else {
      panic!("expected queued update");
    };
    assert_eq!(change.action, ChangeAction::Update);
    assert_eq!(change.base_updated_at, stored.updated_at);

    let WriteOutcome::Queued { change, .. } = repo.delete("s1").await.unwrap() else {
      panic!("expected queued delete");
    };
    assert_eq!(change.data, json!({"id": "s1"}));
    assert!(fx.cache.get::<McardStatus>("s1").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_fetch_by_secondary_key() {
    let fx = Fixture::new();
    fx.remote
      .seed(
        "mcards",
        vec![json!({"id": "m1", "user_id": "u1", "slug": "acme", "full_name": "Acme"})],
      )
      .unwrap();
    let repo = fx.repo::<crate::domain::Mcard>();

    let found = repo.fetch_by_secondary_key("acme").await.unwrap().unwrap();
    assert_eq!(found.data.id, "m1");
    assert!(repo.fetch_by_secondary_key("nope").await.unwrap().is_none());

    fx.remote.set_offline(true);
    let cached = repo.fetch_by_secondary_key("acme").await.unwrap().unwrap();
    assert_eq!(cached.source, CacheSource::Offline);
  }
}
