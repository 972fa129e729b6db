//! Transport-neutral realtime channel types.
//!
//! A transport joins named channels. Each joined channel yields a stream of
//! [`ChannelEvent`]s and exposes presence tracking and leave through
//! [`ChannelControl`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::column_text;

/// Row-level change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

impl ChangeKind {
  pub fn as_wire(&self) -> &'static str {
    match self {
      ChangeKind::Insert => "INSERT",
      ChangeKind::Update => "UPDATE",
      ChangeKind::Delete => "DELETE",
    }
  }
}

/// Which change kinds a filter listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
  All,
  Only(ChangeKind),
}

impl EventFilter {
  pub fn as_wire(&self) -> &'static str {
    match self {
      EventFilter::All => "*",
      EventFilter::Only(kind) => kind.as_wire(),
    }
  }

  fn accepts(&self, kind: ChangeKind) -> bool {
    match self {
      EventFilter::All => true,
      EventFilter::Only(only) => *only == kind,
    }
  }
}

/// A watched table plus an optional column equality filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
  pub schema: String,
  pub table: String,
  pub event: EventFilter,
  pub column_eq: Option<(String, String)>,
}

impl ChangeFilter {
  /// Every change on `table` in the public schema.
  pub fn table(table: &str) -> Self {
    Self {
      schema: "public".to_string(),
      table: table.to_string(),
      event: EventFilter::All,
      column_eq: None,
    }
  }

  /// Only rows whose `column` equals `value`.
  pub fn eq(mut self, column: &str, value: &str) -> Self {
    self.column_eq = Some((column.to_string(), value.to_string()));
    self
  }

  /// Only one change kind.
  pub fn only(mut self, kind: ChangeKind) -> Self {
    self.event = EventFilter::Only(kind);
    self
  }

  /// Filter expression in `column=eq.value` form.
  pub fn wire_filter(&self) -> Option<String> {
    self
      .column_eq
      .as_ref()
      .map(|(column, value)| format!("{}=eq.{}", column, value))
  }

  /// Whether `event` is one this filter listens to.
  ///
  /// Deletes are matched against the old record, everything else against the
  /// new one.
  pub fn matches(&self, event: &ChangeEvent) -> bool {
    if event.table != self.table || event.schema != self.schema || !self.event.accepts(event.kind) {
      return false;
    }

    match &self.column_eq {
      Some((column, value)) => {
        let row = match event.kind {
          ChangeKind::Delete => &event.old_record,
          _ => &event.record,
        };
        column_text(row, column).as_deref() == Some(value.as_str())
      }
      None => true,
    }
  }

  /// Stable channel name derived from the filter.
  pub fn channel_name(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", self.table, &digest[..12])
  }
}

impl fmt::Display for ChangeFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.event.as_wire(), self.schema, self.table)?;
    if let Some(filter) = self.wire_filter() {
      write!(f, ":{}", filter)?;
    }
    Ok(())
  }
}

/// A row-level change pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  pub schema: String,
  pub table: String,
  pub kind: ChangeKind,
  /// New row (empty object for deletes)
  pub record: Value,
  /// Previous row when the server sends it (deletes, updates with replica identity)
  pub old_record: Value,
  pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
  pub fn new(table: &str, kind: ChangeKind, record: Value) -> Self {
    let (record, old_record) = match kind {
      ChangeKind::Delete => (Value::Object(Default::default()), record),
      _ => (record, Value::Object(Default::default())),
    };
    Self {
      schema: "public".to_string(),
      table: table.to_string(),
      kind,
      record,
      old_record,
      commit_timestamp: None,
    }
  }
}

/// What one client announces on a presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
  pub user_id: String,
  pub online_at: DateTime<Utc>,
}

impl PresenceMeta {
  pub fn now(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
      online_at: Utc::now(),
    }
  }
}

/// Presence key -> metas tracked under that key.
pub type PresenceMap = BTreeMap<String, Vec<PresenceMeta>>;

/// Lifecycle of a joined channel as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
  Joined,
  Closed,
  Errored(String),
}

/// Everything a channel can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
  Status(ChannelStatus),
  Change(ChangeEvent),
  /// Full presence snapshot
  PresenceState(PresenceMap),
  /// Incremental presence update
  PresenceDiff {
    joins: PresenceMap,
    leaves: PresenceMap,
  },
}

/// What to listen to on a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
  /// Channel name, without transport prefix
  pub name: String,
  pub changes: Vec<ChangeFilter>,
  /// Enables presence under this key when set
  pub presence_key: Option<String>,
}

/// Outbound operations on a joined channel.
#[async_trait]
pub trait ChannelControl: Send + Sync {
  /// Announce `meta` under this channel's presence key.
  async fn track(&self, meta: PresenceMeta) -> Result<()>;

  /// Withdraw whatever this channel tracked.
  async fn untrack(&self) -> Result<()>;

  /// Leave the channel. Further events stop; calling twice is harmless.
  async fn leave(&self) -> Result<()>;
}

/// A joined channel.
pub struct Channel {
  pub topic: String,
  pub events: mpsc::UnboundedReceiver<ChannelEvent>,
  pub control: Arc<dyn ChannelControl>,
}

/// Something that can join realtime channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
  /// Start joining a channel. `ChannelStatus::Joined` arrives on the event
  /// stream once the server accepted the join.
  async fn join(&self, config: ChannelConfig) -> Result<Channel>;
}

/// Apply a presence diff to a snapshot.
pub fn apply_presence_diff(state: &mut PresenceMap, joins: PresenceMap, leaves: PresenceMap) {
  for (key, left) in leaves {
    if let Some(metas) = state.get_mut(&key) {
      metas.retain(|m| !left.contains(m));
      if metas.is_empty() {
        state.remove(&key);
      }
    }
  }
  for (key, joined) in joins {
    let metas = state.entry(key).or_default();
    for meta in joined {
      if !metas.contains(&meta) {
        metas.push(meta);
      }
    }
  }
}

/// Whether any meta in `state` belongs to `user_id`.
pub fn is_present(state: &PresenceMap, user_id: &str) -> bool {
  state.values().flatten().any(|m| m.user_id == user_id)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_filter_matches_table_kind_and_column() {
    let filter = ChangeFilter::table("mcard_statuses").eq("mcard_id", "m1");

    let insert = ChangeEvent::new(
      "mcard_statuses",
      ChangeKind::Insert,
      json!({"id": "s1", "mcard_id": "m1"}),
    );
    let other_card = ChangeEvent::new(
      "mcard_statuses",
      ChangeKind::Insert,
      json!({"id": "s2", "mcard_id": "m2"}),
    );
    let other_table = ChangeEvent::new("mcards", ChangeKind::Insert, json!({"mcard_id": "m1"}));
    let delete = ChangeEvent::new(
      "mcard_statuses",
      ChangeKind::Delete,
      json!({"id": "s1", "mcard_id": "m1"}),
    );

    assert!(filter.matches(&insert));
    assert!(!filter.matches(&other_card));
    assert!(!filter.matches(&other_table));
    assert!(filter.matches(&delete));
    assert!(!filter.clone().only(ChangeKind::Update).matches(&insert));
  }

  #[test]
  fn test_wire_filter_and_channel_name() {
    let a = ChangeFilter::table("mcard_products").eq("mcard_id", "m1");
    let b = ChangeFilter::table("mcard_products").eq("mcard_id", "m2");

    assert_eq!(a.wire_filter().as_deref(), Some("mcard_id=eq.m1"));
    assert_eq!(a.to_string(), "*:public:mcard_products:mcard_id=eq.m1");
    assert!(a.channel_name().starts_with("mcard_products-"));
    assert_eq!(a.channel_name(), a.clone().channel_name());
    assert_ne!(a.channel_name(), b.channel_name());
  }

  #[test]
  fn test_presence_diff() {
    let alice = PresenceMeta::now("alice");
    let bob = PresenceMeta::now("bob");
    let mut state = PresenceMap::new();

    apply_presence_diff(
      &mut state,
      PresenceMap::from([("k1".to_string(), vec![alice.clone()]), ("k2".to_string(), vec![bob.clone()])]),
      PresenceMap::new(),
    );
    assert!(is_present(&state, "alice"));
    assert!(is_present(&state, "bob"));

    apply_presence_diff(
      &mut state,
      PresenceMap::new(),
      PresenceMap::from([("k1".to_string(), vec![alice])]),
    );
    assert!(!is_present(&state, "alice"));
    assert!(!state.contains_key("k1"));
    assert!(is_present(&state, "bob"));
  }
}
