//! Caching implementations for FinderID and MCard types.

use crate::cache::{Cacheable, Collection};

use super::kind::EntityKind;
use super::types::{Mcard, McardProduct, McardReview, McardStatus, ReportedCard, UserCard};
use super::Entity;

// ============================================================================
// Cacheable implementations
// ============================================================================

macro_rules! cacheable {
  ($ty:ty, $kind:expr) => {
    impl Cacheable for $ty {
      fn cache_key(&self) -> String {
        self.id.clone()
      }

      fn updated_at(&self) -> Option<&str> {
        self.updated_at.as_deref()
      }

      fn collection() -> Collection {
        $kind.collection()
      }
    }

    impl Entity for $ty {
      const KIND: EntityKind = $kind;
    }
  };
}

cacheable!(Mcard, EntityKind::Mcard);
cacheable!(McardStatus, EntityKind::Status);
cacheable!(McardProduct, EntityKind::Product);
cacheable!(McardReview, EntityKind::Review);
cacheable!(ReportedCard, EntityKind::ReportedCard);
cacheable!(UserCard, EntityKind::UserCard);

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, OfflineCache};
  use std::sync::Arc;

  #[test]
  fn test_statuses_grouped_by_mcard() {
    let cache = OfflineCache::new(Arc::new(MemoryStorage::new()));
    let status = McardStatus {
      id: "s1".into(),
      mcard_id: "m1".into(),
      status_text: "Back in 5 min".into(),
      status_color: Some("#22c55e".into()),
      is_active: true,
      expires_at: None,
      created_at: None,
      updated_at: Some("2026-10-01T10:00:00Z".into()),
    };
    cache.save(&status).unwrap();

    assert_eq!(cache.get_all::<McardStatus>(Some("m1")).unwrap(), vec![status]);
    assert!(cache.get_all::<McardStatus>(Some("m2")).unwrap().is_empty());
  }

  #[test]
  fn test_reported_card_by_number() {
    let cache = OfflineCache::new(Arc::new(MemoryStorage::new()));
    let card = ReportedCard {
      id: "rc1".into(),
      card_number: "CNI-0042".into(),
      document_type: "national_id".into(),
      found_location: Some("Gare centrale".into()),
      description: None,
      reporter_id: None,
      status: Some("pending".into()),
      created_at: None,
      updated_at: None,
    };
    cache.save(&card).unwrap();

    let found = cache.get_by_secondary_key::<ReportedCard>("CNI-0042").unwrap();
    assert_eq!(found, Some(card));
  }
}
