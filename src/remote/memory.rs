//! In-memory remote store for tests and offline demos.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{rejected, AuthSession, RemoteStore, Selection, SessionUser};
use crate::cache::{column_text, ID_COLUMN};
use crate::realtime::{ChangeEvent, ChangeKind, LocalHub};

/// Tables of JSON rows behind a mutex, optionally publishing every write to
/// a [`LocalHub`].
#[derive(Default)]
pub struct MemoryRemote {
  tables: Mutex<HashMap<String, Vec<Value>>>,
  user: Mutex<Option<SessionUser>>,
  offline: Mutex<bool>,
  down: Mutex<HashSet<String>>,
  hub: Option<LocalHub>,
}

fn now_text() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Publish every successful write as a change event on `hub`.
  pub fn with_hub(mut self, hub: LocalHub) -> Self {
    self.hub = Some(hub);
    self
  }

  /// While offline every call fails as if the network were down.
  pub fn set_offline(&self, offline: bool) {
    if let Ok(mut flag) = self.offline.lock() {
      *flag = offline;
    }
  }

  /// While down, calls touching `table` fail transiently; other tables still
  /// answer.
  pub fn set_table_down(&self, table: &str, down: bool) {
    if let Ok(mut tables) = self.down.lock() {
      if down {
        tables.insert(table.to_string());
      } else {
        tables.remove(table);
      }
    }
  }

  pub fn set_user(&self, user: Option<SessionUser>) {
    if let Ok(mut current) = self.user.lock() {
      *current = user;
    }
  }

  /// Insert rows as-is, without timestamps or change events.
  pub fn seed(&self, table: &str, rows: Vec<Value>) -> Result<()> {
    let mut tables = self.lock()?;
    tables.entry(table.to_string()).or_default().extend(rows);
    Ok(())
  }

  /// Every row currently in `table`.
  pub fn rows(&self, table: &str) -> Vec<Value> {
    self
      .lock()
      .map(|t| t.get(table).cloned().unwrap_or_default())
      .unwrap_or_default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Value>>>> {
    self.tables.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn ensure_online(&self) -> Result<()> {
    let offline = self
      .offline
      .lock()
      .map(|flag| *flag)
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if offline {
      return Err(eyre!("Network unreachable"));
    }
    Ok(())
  }

  fn ensure_reachable(&self, table: &str) -> Result<()> {
    self.ensure_online()?;
    let down = self
      .down
      .lock()
      .map(|tables| tables.contains(table))
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if down {
      return Err(eyre!("Service unavailable: {}", table));
    }
    Ok(())
  }

  fn publish(&self, table: &str, kind: ChangeKind, row: Value) {
    if let Some(hub) = &self.hub {
      hub.publish_change(ChangeEvent::new(table, kind, row));
    }
  }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
  async fn select(&self, selection: &Selection) -> Result<Vec<Value>> {
    self.ensure_reachable(&selection.table)?;
    let tables = self.lock()?;
    Ok(
      tables
        .get(&selection.table)
        .map(|rows| selection.apply(rows))
        .unwrap_or_default(),
    )
  }

  async fn insert(&self, table: &str, row: Value) -> Result<Value> {
    self.ensure_reachable(table)?;
    let Value::Object(mut fields) = row else {
      return Err(rejected(
        None,
        format!("Failed to insert into {}: row is not an object", table),
      ));
    };

    let id = match fields.get(ID_COLUMN) {
      Some(Value::String(id)) => id.clone(),
      Some(Value::Number(id)) => id.to_string(),
      _ => {
        let id = Uuid::now_v7().to_string();
        fields.insert(ID_COLUMN.to_string(), Value::String(id.clone()));
        id
      }
    };
    let now = now_text();
    if fields.get("created_at").map_or(true, Value::is_null) {
      fields.insert("created_at".to_string(), Value::String(now.clone()));
    }
    fields.insert("updated_at".to_string(), Value::String(now));
    let stored = Value::Object(fields);

    {
      let mut tables = self.lock()?;
      let rows = tables.entry(table.to_string()).or_default();
      if rows
        .iter()
        .any(|r| column_text(r, ID_COLUMN).as_deref() == Some(id.as_str()))
      {
        return Err(rejected(
          None,
          format!("Failed to insert into {}: duplicate id {}", table, id),
        ));
      }
      rows.push(stored.clone());
    }

    self.publish(table, ChangeKind::Insert, stored.clone());
    Ok(stored)
  }

  async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
    self.ensure_reachable(table)?;
    let Value::Object(patch) = patch else {
      return Err(rejected(
        None,
        format!("Failed to update {}: patch is not an object", table),
      ));
    };

    let stored = {
      let mut tables = self.lock()?;
      let row = tables
        .get_mut(table)
        .and_then(|rows| {
          rows
            .iter_mut()
            .find(|r| column_text(r, ID_COLUMN).as_deref() == Some(id))
        })
        .ok_or_else(|| rejected(None, format!("Failed to update {}: no row with id {}", table, id)))?;

      let fields = row
        .as_object_mut()
        .ok_or_else(|| eyre!("Failed to update {}: stored row is not an object", table))?;
      for (column, value) in patch {
        if column != ID_COLUMN {
          fields.insert(column, value);
        }
      }
      fields.insert("updated_at".to_string(), Value::String(now_text()));
      row.clone()
    };

    self.publish(table, ChangeKind::Update, stored.clone());
    Ok(stored)
  }

  async fn delete(&self, table: &str, id: &str) -> Result<()> {
    self.ensure_reachable(table)?;
    let removed = {
      let mut tables = self.lock()?;
      tables.get_mut(table).and_then(|rows| {
        let index = rows
          .iter()
          .position(|r| column_text(r, ID_COLUMN).as_deref() == Some(id))?;
        Some(rows.remove(index))
      })
    };

    if let Some(row) = removed {
      self.publish(table, ChangeKind::Delete, row);
    }
    Ok(())
  }
}

#[async_trait]
impl AuthSession for MemoryRemote {
  async fn get_user(&self) -> Result<Option<SessionUser>> {
    self.ensure_online()?;
    self
      .user
      .lock()
      .map(|u| u.clone())
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::realtime::{ChangeFilter, ChannelConfig, ChannelEvent, RealtimeTransport};
  use crate::remote::is_rejection;
  use serde_json::json;

  #[tokio::test]
  async fn test_insert_assigns_id_and_timestamps() {
    let remote = MemoryRemote::new();
    let stored = remote
      .insert("mcards", json!({"slug": "acme", "name": "Acme"}))
      .await
      .unwrap();

    let id = column_text(&stored, "id").unwrap();
    assert!(!id.is_empty());
    assert!(stored["created_at"].is_string());
    assert_eq!(stored["created_at"], stored["updated_at"]);
    assert_eq!(remote.get("mcards", &id).await.unwrap(), Some(stored));
  }

  #[tokio::test]
  async fn test_insert_rejects_duplicate_id() {
    let remote = MemoryRemote::new();
    remote.insert("mcards", json!({"id": "m1"})).await.unwrap();
    let err = remote.insert("mcards", json!({"id": "m1"})).await.unwrap_err();
    assert!(is_rejection(&err));
  }

  #[tokio::test]
  async fn test_update_merges_and_bumps_updated_at() {
    let remote = MemoryRemote::new();
    remote
      .seed(
        "mcards",
        vec![json!({"id": "m1", "name": "Old", "slug": "old", "updated_at": "2020-01-01T00:00:00Z"})],
      )
      .unwrap();

    let stored = remote
      .update("mcards", "m1", json!({"name": "New", "id": "hijack"}))
      .await
      .unwrap();
    assert_eq!(stored["name"], "New");
    assert_eq!(stored["slug"], "old");
    assert_eq!(stored["id"], "m1");
    assert_ne!(stored["updated_at"], "2020-01-01T00:00:00Z");

    let err = remote.update("mcards", "missing", json!({})).await.unwrap_err();
    assert!(is_rejection(&err));
  }

  #[tokio::test]
  async fn test_delete_missing_row_is_ok() {
    let remote = MemoryRemote::new();
    remote.delete("mcards", "nope").await.unwrap();
  }

  #[tokio::test]
  async fn test_offline_fails_every_call() {
    let remote = MemoryRemote::new();
    remote.set_user(Some(SessionUser {
      id: "u1".into(),
      email: None,
    }));
    remote.set_offline(true);

    assert!(remote.select(&Selection::from("mcards")).await.is_err());
    let err = remote.insert("mcards", json!({})).await.unwrap_err();
    assert!(!is_rejection(&err));
    assert!(remote.get_user().await.is_err());

    remote.set_offline(false);
    assert_eq!(remote.get_user().await.unwrap().map(|u| u.id).as_deref(), Some("u1"));
  }

  #[tokio::test]
  async fn test_table_down_fails_only_that_table() {
    let remote = MemoryRemote::new();
    remote.set_table_down("mcard_reviews", true);

    let err = remote.insert("mcard_reviews", json!({"id": "r1"})).await.unwrap_err();
    assert!(!is_rejection(&err));
    remote.insert("mcards", json!({"id": "m1"})).await.unwrap();

    remote.set_table_down("mcard_reviews", false);
    remote.insert("mcard_reviews", json!({"id": "r1"})).await.unwrap();
  }

  #[tokio::test]
  async fn test_writes_publish_changes() {
    let hub = LocalHub::new();
    let remote = MemoryRemote::new().with_hub(hub.clone());
    let filter = ChangeFilter::table("mcard_reviews");
    let mut channel = hub
      .client()
      .join(ChannelConfig {
        name: filter.channel_name(),
        changes: vec![filter],
        presence_key: None,
      })
      .await
      .unwrap();

    remote.insert("mcard_reviews", json!({"id": "r1"})).await.unwrap();
    remote.delete("mcard_reviews", "r1").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = channel.events.try_recv() {
      if let ChannelEvent::Change(change) = event {
        kinds.push(change.kind);
      }
    }
    assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Delete]);
  }
}
