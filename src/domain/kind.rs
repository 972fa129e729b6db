//! Catalogue of the entity kinds the sync layer caches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::Collection;

/// Kinds of remote rows mirrored in the offline cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  /// MCard profile page
  Mcard,
  /// Short-lived status line shown on an MCard
  Status,
  /// Catalog item on an MCard storefront
  Product,
  /// Visitor review of an MCard
  Review,
  /// Identity document reported as found
  ReportedCard,
  /// Identity document registered by its owner
  UserCard,
}

impl EntityKind {
  pub const ALL: [EntityKind; 6] = [
    EntityKind::Mcard,
    EntityKind::Status,
    EntityKind::Product,
    EntityKind::Review,
    EntityKind::ReportedCard,
    EntityKind::UserCard,
  ];

  /// Name used for cache keys and pending changes.
  pub fn as_str(&self) -> &'static str {
    match self {
      EntityKind::Mcard => "mcard",
      EntityKind::Status => "status",
      EntityKind::Product => "product",
      EntityKind::Review => "review",
      EntityKind::ReportedCard => "reported_card",
      EntityKind::UserCard => "user_card",
    }
  }

  /// Remote table name.
  pub fn table(&self) -> &'static str {
    match self {
      EntityKind::Mcard => "mcards",
      EntityKind::Status => "mcard_statuses",
      EntityKind::Product => "mcard_products",
      EntityKind::Review => "mcard_reviews",
      EntityKind::ReportedCard => "reported_cards",
      EntityKind::UserCard => "user_cards",
    }
  }

  /// Cache layout for this kind.
  pub fn collection(&self) -> Collection {
    let name = self.as_str();
    match self {
      EntityKind::Mcard => Collection::flat(name).with_secondary("slug"),
      EntityKind::Status | EntityKind::Product | EntityKind::Review => {
        Collection::grouped_by(name, "mcard_id")
      }
      EntityKind::ReportedCard => Collection::flat(name).with_secondary("card_number"),
      EntityKind::UserCard => Collection::grouped_by(name, "user_id").with_secondary("card_number"),
    }
  }

  /// Column lists are ordered by (newest first), if any.
  pub fn ordered_by(&self) -> Option<&'static str> {
    match self {
      EntityKind::Status | EntityKind::Review | EntityKind::ReportedCard => Some("created_at"),
      _ => None,
    }
  }

  /// Look a kind up by its remote table name.
  pub fn from_table(table: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.table() == table)
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let needle = s.trim().to_lowercase().replace('-', "_");
    Self::ALL
      .into_iter()
      .find(|k| k.as_str() == needle || k.table() == needle)
      .ok_or_else(|| {
        let names: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown entity kind '{}' (expected one of: {})", s, names.join(", "))
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_by_name_and_table() {
    assert_eq!("status".parse::<EntityKind>(), Ok(EntityKind::Status));
    assert_eq!("mcard_statuses".parse::<EntityKind>(), Ok(EntityKind::Status));
    assert_eq!("user-card".parse::<EntityKind>(), Ok(EntityKind::UserCard));
    assert!("invoice".parse::<EntityKind>().is_err());
  }

  #[test]
  fn test_collection_names_are_unique() {
    let mut names: Vec<&str> = EntityKind::ALL.iter().map(|k| k.collection().name).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), EntityKind::ALL.len());
  }

  #[test]
  fn test_parent_scoping() {
    assert_eq!(EntityKind::Status.collection().parent_column, Some("mcard_id"));
    assert_eq!(EntityKind::UserCard.collection().parent_column, Some("user_id"));
    assert!(!EntityKind::ReportedCard.collection().is_grouped());
    assert_eq!(EntityKind::from_table("mcard_reviews"), Some(EntityKind::Review));
  }
}
