//! FinderID and MCard entities mirrored by the sync layer.

mod cache;
mod kind;
mod types;

pub use kind::EntityKind;
pub use types::{Mcard, McardProduct, McardReview, McardStatus, ReportedCard, UserCard};

use crate::cache::Cacheable;

/// A cacheable entity backed by a remote table.
pub trait Entity: Cacheable {
  const KIND: EntityKind;
}
