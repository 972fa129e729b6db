//! Ordered replay of the pending queue against the remote store.
//!
//! Changes are applied oldest first. The walk stops at the first transient
//! remote failure so nothing overtakes an earlier change. A change the remote
//! store rejects outright is dropped and reported instead, since retrying it
//! would block the queue for good. Updates and deletes
//! carrying a base version are checked against the remote row first; if the
//! row moved on in the meantime the remote row wins and the local change is
//! dropped and reported as a conflict.

use color_eyre::Result;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

use super::repository::{insert_payload, patch_payload};
use crate::cache::{
  column_text, record_id, CacheStorage, ChangeAction, OfflineCache, PendingChange, PendingQueue,
};
use crate::domain::EntityKind;
use crate::remote::{is_rejection, RemoteStore};

const UPDATED_AT: &str = "updated_at";

/// A queued change that lost against a newer remote row.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
  pub change: PendingChange,
  /// Remote row that replaced the local change, None if it was deleted
  pub remote: Option<Value>,
}

/// A queued change the remote store refused for good.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
  pub change: PendingChange,
  pub reason: String,
}

/// What one replay did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplayReport {
  pub applied: Vec<PendingChange>,
  pub conflicts: Vec<Conflict>,
  /// Changes that can never be applied (unknown kind, missing id)
  pub dropped: Vec<PendingChange>,
  pub rejected: Vec<Rejection>,
  /// Changes still queued afterwards
  pub remaining: usize,
  /// Transient remote error that stopped the walk
  pub failure: Option<String>,
}

impl ReplayReport {
  pub fn is_complete(&self) -> bool {
    self.failure.is_none() && self.remaining == 0
  }
}

enum Outcome {
  Applied,
  Conflict(Option<Value>),
  Dropped(&'static str),
}

/// `updated_at` values this replay produced, per (kind, id).
type Confirmed = HashMap<(EntityKind, String), Option<String>>;

/// Replay every queued change in order.
///
/// Storage errors abort with `Err`. Rejections are removed from the queue and
/// listed in [`ReplayReport::rejected`]; any other remote error stops the
/// walk and is reported in [`ReplayReport::failure`]. The last-sync marker is
/// left alone since no collection was refetched.
pub async fn replay<S: CacheStorage>(
  queue: &PendingQueue<S>,
  cache: &OfflineCache<S>,
  remote: &dyn RemoteStore,
) -> Result<ReplayReport> {
  let mut report = ReplayReport::default();
  let mut confirmed = Confirmed::new();

  for change in queue.list()? {
    let outcome = match apply(&change, cache, remote, &mut confirmed).await {
      Ok(outcome) => outcome,
      Err(e) if is_rejection(&e) => {
        warn!(
          change_id = %change.id,
          entity_type = %change.entity_type,
          action = %change.action,
          error = %e,
          "Remote rejected change, dropping it"
        );
        queue.remove(&change.id)?;
        report.rejected.push(Rejection {
          change,
          reason: e.to_string(),
        });
        continue;
      }
      Err(e) => {
        warn!(
          change_id = %change.id,
          entity_type = %change.entity_type,
          action = %change.action,
          error = %e,
          "Replay stopped"
        );
        report.failure = Some(e.to_string());
        break;
      }
    };

    queue.remove(&change.id)?;
    match outcome {
      Outcome::Applied => report.applied.push(change),
      Outcome::Conflict(remote) => {
        warn!(
          change_id = %change.id,
          entity_type = %change.entity_type,
          action = %change.action,
          "Remote row changed since the local edit, keeping remote"
        );
        report.conflicts.push(Conflict { change, remote });
      }
      Outcome::Dropped(reason) => {
        warn!(
          change_id = %change.id,
          entity_type = %change.entity_type,
          reason,
          "Dropping unreplayable change"
        );
        report.dropped.push(change);
      }
    }
  }

  report.remaining = queue.len()?;

  info!(
    applied = report.applied.len(),
    conflicts = report.conflicts.len(),
    dropped = report.dropped.len(),
    rejected = report.rejected.len(),
    remaining = report.remaining,
    "Replay finished"
  );
  Ok(report)
}

async fn apply<S: CacheStorage>(
  change: &PendingChange,
  cache: &OfflineCache<S>,
  remote: &dyn RemoteStore,
  confirmed: &mut Confirmed,
) -> Result<Outcome> {
  let Ok(kind) = change.entity_type.parse::<EntityKind>() else {
    return Ok(Outcome::Dropped("unknown entity kind"));
  };
  let table = kind.table();
  let collection = kind.collection();

  if change.action == ChangeAction::Create {
    let stored = remote.insert(table, insert_payload(change.data.clone())).await?;
    if let Some(id) = record_id(&stored) {
      confirmed.insert((kind, id), column_text(&stored, UPDATED_AT));
    }
    cache.save_record(collection, stored)?;
    return Ok(Outcome::Applied);
  }

  let Some(id) = record_id(&change.data) else {
    return Ok(Outcome::Dropped("change has no id"));
  };

  // An earlier change in this replay already moved the row on.
  let base = match confirmed.get(&(kind, id.clone())) {
    Some(ours) => ours.clone(),
    None => change.base_updated_at.clone(),
  };

  if let Some(base) = base {
    let current = remote.get(table, &id).await?;
    let drifted = match &current {
      Some(row) => column_text(row, UPDATED_AT).as_deref() != Some(base.as_str()),
      // Deleting a row that is already gone is what we wanted anyway.
      None => change.action == ChangeAction::Update,
    };
    if drifted {
      match &current {
        Some(row) => cache.save_record(collection, row.clone())?,
        None => {
          cache.delete_record(collection, &id)?;
        }
      }
      return Ok(Outcome::Conflict(current));
    }
  }

  match change.action {
    ChangeAction::Update => {
      let stored = remote
        .update(table, &id, patch_payload(change.data.clone()))
        .await?;
      confirmed.insert((kind, id), column_text(&stored, UPDATED_AT));
      cache.save_record(collection, stored)?;
    }
    ChangeAction::Delete => {
      remote.delete(table, &id).await?;
      cache.delete_record(collection, &id)?;
      confirmed.insert((kind, id), None);
    }
    ChangeAction::Create => {}
  }
  Ok(Outcome::Applied)
}
