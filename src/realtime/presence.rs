//! Shared presence channel with reference counting.
//!
//! Every consumer of presence (a "who is online" badge, the session that
//! announces itself) goes through one [`PresenceRegistry`]. The underlying
//! channel is joined on the first `acquire` and left exactly once when the
//! last holder releases it. A later acquire joins a fresh channel.
//!
//! Watchers are told about a user's online state only after the channel's
//! first presence sync, so an early "offline" is never reported just because
//! the snapshot had not arrived yet.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{
  apply_presence_diff, is_present, ChannelConfig, ChannelControl, ChannelEvent, ChannelStatus,
  PresenceMap, PresenceMeta, RealtimeTransport,
};
use crate::remote::AuthSession;

type PresenceCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct Watcher {
  id: u64,
  callback: PresenceCallback,
}

#[derive(Default)]
struct Roster {
  state: PresenceMap,
  watchers: HashMap<String, Vec<Watcher>>,
  last_notified: HashMap<String, bool>,
  synced: bool,
  /// Bumped on every teardown so a stale pump cannot touch the new channel
  generation: u64,
}

impl Roster {
  /// Callbacks owed for users whose online state changed since last told.
  fn pending_notifications(&mut self) -> Vec<(PresenceCallback, bool)> {
    if !self.synced {
      return Vec::new();
    }
    let mut calls = Vec::new();
    for (user_id, watchers) in &self.watchers {
      let online = is_present(&self.state, user_id);
      if self.last_notified.get(user_id) == Some(&online) {
        continue;
      }
      self.last_notified.insert(user_id.clone(), online);
      calls.extend(watchers.iter().map(|w| (Arc::clone(&w.callback), online)));
    }
    calls
  }
}

struct Shared {
  roster: Mutex<Roster>,
  synced: watch::Sender<bool>,
}

impl Shared {
  fn lock(&self) -> Result<MutexGuard<'_, Roster>> {
    self.roster.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Mutate the roster if it still belongs to `generation`, then run any
  /// callbacks that became due. Callbacks run outside the lock.
  fn update(&self, generation: u64, apply: impl FnOnce(&mut Roster)) {
    let calls = {
      let Ok(mut roster) = self.lock() else {
        return;
      };
      if roster.generation != generation {
        return;
      }
      apply(&mut *roster);
      self.synced.send_replace(roster.synced);
      roster.pending_notifications()
    };
    for (callback, online) in calls {
      callback(online);
    }
  }

  /// Add a watcher; returns the value to deliver now if already synced.
  fn register(&self, user_id: &str, id: u64, callback: PresenceCallback) -> Result<Option<bool>> {
    let mut roster = self.lock()?;
    roster
      .watchers
      .entry(user_id.to_string())
      .or_default()
      .push(Watcher { id, callback });
    if !roster.synced {
      return Ok(None);
    }
    let online = is_present(&roster.state, user_id);
    roster.last_notified.insert(user_id.to_string(), online);
    Ok(Some(online))
  }

  fn unregister(&self, user_id: &str, id: u64) {
    let Ok(mut roster) = self.lock() else {
      return;
    };
    if let Some(watchers) = roster.watchers.get_mut(user_id) {
      watchers.retain(|w| w.id != id);
      if watchers.is_empty() {
        roster.watchers.remove(user_id);
        roster.last_notified.remove(user_id);
      }
    }
  }

  fn reset(&self) {
    if let Ok(mut roster) = self.lock() {
      roster.generation += 1;
      roster.state.clear();
      roster.last_notified.clear();
      roster.synced = false;
    }
    self.synced.send_replace(false);
  }
}

struct Active {
  control: Arc<dyn ChannelControl>,
  pump: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
  refs: usize,
  active: Option<Active>,
}

struct RegistryInner {
  transport: Arc<dyn RealtimeTransport>,
  channel_name: String,
  presence_key: String,
  lifecycle: tokio::sync::Mutex<Lifecycle>,
  shared: Arc<Shared>,
  next_watch: AtomicU64,
}

/// Reference-counted access to one presence channel.
#[derive(Clone)]
pub struct PresenceRegistry {
  inner: Arc<RegistryInner>,
}

impl PresenceRegistry {
  pub fn new(transport: Arc<dyn RealtimeTransport>, channel_name: &str) -> Self {
    let (synced, _) = watch::channel(false);
    Self {
      inner: Arc::new(RegistryInner {
        transport,
        channel_name: channel_name.to_string(),
        presence_key: Uuid::now_v7().to_string(),
        lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        shared: Arc::new(Shared {
          roster: Mutex::new(Roster::default()),
          synced,
        }),
        next_watch: AtomicU64::new(1),
      }),
    }
  }

  pub fn channel_name(&self) -> &str {
    &self.inner.channel_name
  }

  /// Take a reference, joining the channel if this is the first.
  pub async fn acquire(&self) -> Result<()> {
    let mut lifecycle = self.inner.lifecycle.lock().await;
    if lifecycle.active.is_none() {
      let generation = self.inner.shared.lock()?.generation;
      let channel = self
        .inner
        .transport
        .join(ChannelConfig {
          name: self.inner.channel_name.clone(),
          changes: Vec::new(),
          presence_key: Some(self.inner.presence_key.clone()),
        })
        .await
        .map_err(|e| eyre!("Failed to join presence channel: {}", e))?;

      info!(topic = %channel.topic, "Joining presence channel");
      let pump = tokio::spawn(pump(
        Arc::clone(&self.inner.shared),
        generation,
        channel.topic,
        channel.events,
      ));
      lifecycle.active = Some(Active {
        control: channel.control,
        pump,
      });
    }
    lifecycle.refs += 1;
    Ok(())
  }

  /// Drop a reference, leaving the channel when it was the last.
  pub async fn release(&self) {
    let mut lifecycle = self.inner.lifecycle.lock().await;
    if lifecycle.refs == 0 {
      warn!(channel = %self.inner.channel_name, "Presence released more often than acquired");
      return;
    }
    lifecycle.refs -= 1;
    if lifecycle.refs > 0 {
      return;
    }
    let Some(active) = lifecycle.active.take() else {
      return;
    };

    self.inner.shared.reset();
    if let Err(e) = active.control.leave().await {
      debug!(error = %e, "Leaving presence channel failed");
    }
    active.pump.abort();
    info!(channel = %self.inner.channel_name, "Left presence channel");
  }

  /// Current number of holders.
  pub async fn ref_count(&self) -> usize {
    self.inner.lifecycle.lock().await.refs
  }

  /// Announce `user_id` as online until the ticket is untracked or dropped.
  ///
  /// A registry announces one identity; tracking again replaces it.
  pub async fn track_self(&self, user_id: &str) -> Result<PresenceTicket> {
    self.acquire().await?;

    let tracked = {
      let lifecycle = self.inner.lifecycle.lock().await;
      match &lifecycle.active {
        Some(active) => active.control.track(PresenceMeta::now(user_id)).await,
        None => Err(eyre!("Presence channel is not joined")),
      }
    };
    if let Err(e) = tracked {
      self.release().await;
      return Err(eyre!("Failed to track presence for {}: {}", user_id, e));
    }

    info!(user_id, "Tracking presence");
    Ok(PresenceTicket {
      registry: self.clone(),
      user_id: user_id.to_string(),
      active: true,
    })
  }

  /// Track whoever is signed in. Anonymous sessions track nothing.
  pub async fn track_session(&self, session: &dyn AuthSession) -> Result<Option<PresenceTicket>> {
    match session.get_user().await? {
      Some(user) => Ok(Some(self.track_self(&user.id).await?)),
      None => {
        debug!("No signed-in user, not tracking presence");
        Ok(None)
      }
    }
  }

  /// Call `on_change` with `user_id`'s online state, now if the channel has
  /// synced and otherwise on the first sync, then on every transition.
  pub async fn watch<F>(&self, user_id: &str, on_change: F) -> Result<PresenceWatch>
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self.acquire().await?;

    let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
    let callback: PresenceCallback = Arc::new(on_change);
    let immediate = match self
      .inner
      .shared
      .register(user_id, id, Arc::clone(&callback))
    {
      Ok(immediate) => immediate,
      Err(e) => {
        self.release().await;
        return Err(e);
      }
    };
    if let Some(online) = immediate {
      callback(online);
    }

    Ok(PresenceWatch {
      registry: self.clone(),
      user_id: user_id.to_string(),
      id,
      active: true,
    })
  }

  pub fn is_online(&self, user_id: &str) -> bool {
    self
      .inner
      .shared
      .lock()
      .map(|roster| is_present(&roster.state, user_id))
      .unwrap_or(false)
  }

  /// Distinct user ids currently present, sorted.
  pub fn online_users(&self) -> Vec<String> {
    let Ok(roster) = self.inner.shared.lock() else {
      return Vec::new();
    };
    roster
      .state
      .values()
      .flatten()
      .map(|meta| meta.user_id.clone())
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect()
  }

  /// Whether the first presence snapshot of the current channel arrived.
  pub fn is_synced(&self) -> bool {
    *self.inner.shared.synced.borrow()
  }

  /// Wait for the current channel's first presence snapshot.
  pub async fn wait_synced(&self) -> Result<()> {
    let mut synced = self.inner.shared.synced.subscribe();
    synced
      .wait_for(|s| *s)
      .await
      .map(|_| ())
      .map_err(|e| eyre!("Presence registry closed: {}", e))
  }

  async fn untrack(&self) {
    let lifecycle = self.inner.lifecycle.lock().await;
    if let Some(active) = &lifecycle.active {
      if let Err(e) = active.control.untrack().await {
        debug!(error = %e, "Untracking presence failed");
      }
    }
  }

  fn release_in_background(&self, untrack: bool) {
    let registry = self.clone();
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          if untrack {
            registry.untrack().await;
          }
          registry.release().await;
        });
      }
      Err(_) => warn!(
        channel = %self.inner.channel_name,
        "No runtime to release presence channel"
      ),
    }
  }
}

async fn pump(
  shared: Arc<Shared>,
  generation: u64,
  topic: String,
  mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
  while let Some(event) = events.recv().await {
    match event {
      ChannelEvent::Status(ChannelStatus::Joined) => {
        info!(topic = %topic, "Presence channel joined");
      }
      ChannelEvent::PresenceState(state) => {
        debug!(topic = %topic, keys = state.len(), "Presence sync");
        shared.update(generation, |roster| {
          roster.state = state;
          roster.synced = true;
        });
      }
      ChannelEvent::PresenceDiff { joins, leaves } => {
        shared.update(generation, |roster| {
          apply_presence_diff(&mut roster.state, joins, leaves);
        });
      }
      ChannelEvent::Status(status) => {
        warn!(topic = %topic, status = ?status, "Presence channel ended");
        shared.update(generation, |roster| {
          roster.state.clear();
          roster.synced = false;
        });
        break;
      }
      ChannelEvent::Change(_) => {}
    }
  }
}

/// Keeps this client announced as online. Dropping it untracks in the
/// background.
pub struct PresenceTicket {
  registry: PresenceRegistry,
  user_id: String,
  active: bool,
}

impl PresenceTicket {
  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// Withdraw the announcement and release the channel.
  pub async fn untrack(mut self) {
    self.active = false;
    self.registry.untrack().await;
    self.registry.release().await;
    info!(user_id = %self.user_id, "Stopped tracking presence");
  }
}

impl Drop for PresenceTicket {
  fn drop(&mut self) {
    if self.active {
      self.registry.release_in_background(true);
    }
  }
}

/// A registered online/offline callback for one user.
pub struct PresenceWatch {
  registry: PresenceRegistry,
  user_id: String,
  id: u64,
  active: bool,
}

impl PresenceWatch {
  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// Stop watching and release the channel.
  pub async fn unsubscribe(mut self) {
    self.active = false;
    self.registry.inner.shared.unregister(&self.user_id, self.id);
    self.registry.release().await;
  }
}

impl Drop for PresenceWatch {
  fn drop(&mut self) {
    if self.active {
      self.registry.inner.shared.unregister(&self.user_id, self.id);
      self.registry.release_in_background(false);
    }
  }
}
