//! Remote store and auth session the sync layer talks to.
//!
//! The hosted backend is opaque: CRUD over named tables with equality
//! filters and ordering, rows as JSON, plus the current auth session.

mod memory;
mod rest;

pub use memory::MemoryRemote;
pub use rest::RestClient;

use async_trait::async_trait;
use color_eyre::{
  eyre::{eyre, Report},
  Result,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::cache::{column_text, ID_COLUMN};

/// Sort order for a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
  pub column: String,
  pub ascending: bool,
}

/// A `select` against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
  pub table: String,
  /// Column equality filters, all of which must match
  pub filters: Vec<(String, String)>,
  pub order: Option<Order>,
  pub limit: Option<usize>,
}

impl Selection {
  pub fn from(table: &str) -> Self {
    Self {
      table: table.to_string(),
      filters: Vec::new(),
      order: None,
      limit: None,
    }
  }

  pub fn eq(mut self, column: &str, value: &str) -> Self {
    self.filters.push((column.to_string(), value.to_string()));
    self
  }

  pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
    self.order = Some(Order {
      column: column.to_string(),
      ascending,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Whether `row` passes every equality filter.
  pub fn matches(&self, row: &Value) -> bool {
    self
      .filters
      .iter()
      .all(|(column, value)| column_text(row, column).as_deref() == Some(value.as_str()))
  }

  /// Filter, order and limit `rows` the way the remote store would.
  pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
    let mut selected: Vec<Value> = rows
      .into_iter()
      .filter(|r| self.matches(r))
      .cloned()
      .collect();

    if let Some(order) = &self.order {
      selected.sort_by(|a, b| {
        let ord = column_text(a, &order.column).cmp(&column_text(b, &order.column));
        if order.ascending {
          ord
        } else {
          ord.reverse()
        }
      });
    }
    if let Some(limit) = self.limit {
      selected.truncate(limit);
    }
    selected
  }
}

/// A request the remote store refused and will keep refusing (duplicate id,
/// failed validation, missing row). Anything else is treated as transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
  /// HTTP status, when the refusal came over HTTP
  pub status: Option<u16>,
  pub reason: String,
}

impl fmt::Display for Rejected {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.status {
      Some(status) => write!(f, "Rejected ({}): {}", status, self.reason),
      None => write!(f, "Rejected: {}", self.reason),
    }
  }
}

impl std::error::Error for Rejected {}

/// Error for a request that must not be retried.
pub fn rejected(status: Option<u16>, reason: impl Into<String>) -> Report {
  Report::new(Rejected {
    status,
    reason: reason.into(),
  })
}

/// Whether `error` is a permanent refusal rather than a transient failure.
pub fn is_rejection(error: &Report) -> bool {
  error.downcast_ref::<Rejected>().is_some()
}

/// Authenticated identity of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
  pub id: String,
  #[serde(default)]
  pub email: Option<String>,
}

/// CRUD access to the hosted backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Rows matching `selection`.
  async fn select(&self, selection: &Selection) -> Result<Vec<Value>>;

  /// Insert `row`, returning the stored row.
  async fn insert(&self, table: &str, row: Value) -> Result<Value>;

  /// Apply `patch` to the row with `id`, returning the stored row.
  async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value>;

  /// Delete the row with `id`. Deleting a missing row is not an error.
  async fn delete(&self, table: &str, id: &str) -> Result<()>;

  /// The row with `id`, if any.
  async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
    let selection = Selection::from(table).eq(ID_COLUMN, id).limit(1);
    Ok(self.select(&selection).await?.into_iter().next())
  }
}

/// Access to the current auth session.
#[async_trait]
pub trait AuthSession: Send + Sync {
  /// The signed-in user, or None when there is no valid session.
  async fn get_user(&self) -> Result<Option<SessionUser>>;
}

/// Convert remote rows into typed entities.
pub fn from_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Result<Vec<T>> {
  rows
    .into_iter()
    .map(|row| from_row(table, row))
    .collect()
}

/// Convert one remote row into a typed entity.
pub fn from_row<T: DeserializeOwned>(table: &str, row: Value) -> Result<T> {
  serde_json::from_value(row).map_err(|e| eyre!("Failed to parse {} row: {}", table, e))
}

/// Convert a typed entity into a row.
pub fn to_row<T: Serialize>(table: &str, entity: &T) -> Result<Value> {
  serde_json::to_value(entity).map_err(|e| eyre!("Failed to serialize {} row: {}", table, e))
}
