//! In-process realtime broker.
//!
//! `LocalHub` stands in for the hosted realtime service: every
//! [`LocalClient`] is one simulated browser session, channels with the same
//! name share presence, and `publish_change` fans row changes out to every
//! channel whose filters match. Used by tests and by `MemoryRemote`.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::channel::{
  Channel, ChannelConfig, ChannelControl, ChannelEvent, ChannelStatus, ChangeEvent, PresenceMap,
  PresenceMeta, RealtimeTransport,
};

struct Member {
  client: u64,
  config: ChannelConfig,
  presence_key: String,
  tracked: Option<PresenceMeta>,
  tx: mpsc::UnboundedSender<ChannelEvent>,
  activated: bool,
}

#[derive(Default)]
struct HubInner {
  next_id: u64,
  members: HashMap<u64, Member>,
  opened: usize,
  closed: usize,
  hold_joins: bool,
}

impl HubInner {
  fn presence_state(&self, name: &str) -> PresenceMap {
    let mut state = PresenceMap::new();
    for member in self.members.values() {
      if member.config.name == name && member.activated {
        if let Some(meta) = &member.tracked {
          state
            .entry(member.presence_key.clone())
            .or_default()
            .push(meta.clone());
        }
      }
    }
    state
  }

  fn broadcast(&self, name: &str, event: ChannelEvent) {
    for member in self.members.values() {
      if member.config.name == name && member.activated {
        let _ = member.tx.send(event.clone());
      }
    }
  }

  fn activate(&mut self, id: u64) {
    let snapshot = {
      let Some(member) = self.members.get(&id) else {
        return;
      };
      let name = member.config.name.clone();
      member.config.presence_key.is_some().then(|| self.presence_state(&name))
    };

    if let Some(member) = self.members.get_mut(&id) {
      member.activated = true;
      let _ = member.tx.send(ChannelEvent::Status(ChannelStatus::Joined));
      if let Some(state) = snapshot {
        let _ = member.tx.send(ChannelEvent::PresenceState(state));
      }
    }
  }

  /// Remove a member, telling the rest of its channel it left.
  fn remove(&mut self, id: u64) -> bool {
    let Some(member) = self.members.remove(&id) else {
      return false;
    };
    self.closed += 1;

    if let Some(meta) = member.tracked {
      let leaves = PresenceMap::from([(member.presence_key.clone(), vec![meta])]);
      self.broadcast(
        &member.config.name,
        ChannelEvent::PresenceDiff {
          joins: PresenceMap::new(),
          leaves,
        },
      );
    }
    let _ = member.tx.send(ChannelEvent::Status(ChannelStatus::Closed));
    true
  }
}

/// Shared in-process realtime broker.
#[derive(Clone, Default)]
pub struct LocalHub {
  inner: Arc<Mutex<HubInner>>,
}

impl LocalHub {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, HubInner>> {
    lock_hub(&self.inner)
  }

  /// A new simulated client session.
  pub fn client(&self) -> LocalClient {
    let id = match self.lock() {
      Ok(mut inner) => {
        inner.next_id += 1;
        inner.next_id
      }
      Err(_) => 0,
    };
    LocalClient {
      hub: self.clone(),
      id,
    }
  }

  /// Deliver a row change to every channel listening for it.
  pub fn publish_change(&self, event: ChangeEvent) {
    let Ok(inner) = self.lock() else {
      return;
    };
    let mut delivered = 0;
    for member in inner.members.values() {
      if member.activated && member.config.changes.iter().any(|f| f.matches(&event)) {
        let _ = member.tx.send(ChannelEvent::Change(event.clone()));
        delivered += 1;
      }
    }
    debug!(table = %event.table, kind = ?event.kind, delivered, "Published change");
  }

  /// Drop every channel of `client`, as if its connection went away.
  pub fn disconnect(&self, client: &LocalClient) {
    let Ok(mut inner) = self.lock() else {
      return;
    };
    let ids: Vec<u64> = inner
      .members
      .iter()
      .filter(|(_, m)| m.client == client.id)
      .map(|(id, _)| *id)
      .collect();
    for id in ids {
      inner.remove(id);
    }
  }

  /// Delay join acknowledgements until `release_joins`.
  pub fn hold_joins(&self) {
    if let Ok(mut inner) = self.lock() {
      inner.hold_joins = true;
    }
  }

  /// Acknowledge every held join.
  pub fn release_joins(&self) {
    let Ok(mut inner) = self.lock() else {
      return;
    };
    inner.hold_joins = false;
    let pending: Vec<u64> = inner
      .members
      .iter()
      .filter(|(_, m)| !m.activated)
      .map(|(id, _)| *id)
      .collect();
    for id in pending {
      inner.activate(id);
    }
  }

  /// Channels joined since the hub was created.
  pub fn channels_opened(&self) -> usize {
    self.lock().map(|i| i.opened).unwrap_or_default()
  }

  /// Channels left or disconnected since the hub was created.
  pub fn channels_closed(&self) -> usize {
    self.lock().map(|i| i.closed).unwrap_or_default()
  }

  /// Channels currently joined.
  pub fn open_channels(&self) -> usize {
    self.lock().map(|i| i.members.len()).unwrap_or_default()
  }
}

fn lock_hub(inner: &Mutex<HubInner>) -> Result<MutexGuard<'_, HubInner>> {
  inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

/// One simulated client session on a [`LocalHub`].
#[derive(Clone)]
pub struct LocalClient {
  hub: LocalHub,
  id: u64,
}

impl LocalClient {
  pub fn id(&self) -> u64 {
    self.id
  }
}

#[async_trait]
impl RealtimeTransport for LocalClient {
  async fn join(&self, config: ChannelConfig) -> Result<Channel> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut inner = self.hub.lock()?;

    inner.next_id += 1;
    let id = inner.next_id;
    let presence_key = config
      .presence_key
      .clone()
      .unwrap_or_else(|| format!("client-{}-{}", self.id, id));
    let topic = format!("realtime:{}", config.name);

    inner.members.insert(
      id,
      Member {
        client: self.id,
        config,
        presence_key,
        tracked: None,
        tx,
        activated: false,
      },
    );
    inner.opened += 1;
    if !inner.hold_joins {
      inner.activate(id);
    }

    Ok(Channel {
      topic,
      events: rx,
      control: Arc::new(LocalMember {
        hub: Arc::clone(&self.hub.inner),
        id,
      }),
    })
  }
}

struct LocalMember {
  hub: Arc<Mutex<HubInner>>,
  id: u64,
}

#[async_trait]
impl ChannelControl for LocalMember {
  async fn track(&self, meta: PresenceMeta) -> Result<()> {
    let mut inner = lock_hub(&self.hub)?;
    let member = inner
      .members
      .get_mut(&self.id)
      .ok_or_else(|| eyre!("Channel already left"))?;

    // Tracking again replaces the previous announcement.
    let previous = member.tracked.replace(meta.clone());
    let name = member.config.name.clone();
    let key = member.presence_key.clone();
    let leaves = match previous {
      Some(old) => PresenceMap::from([(key.clone(), vec![old])]),
      None => PresenceMap::new(),
    };
    let joins = PresenceMap::from([(key, vec![meta])]);

    inner.broadcast(&name, ChannelEvent::PresenceDiff { joins, leaves });
    Ok(())
  }

  async fn untrack(&self) -> Result<()> {
    let mut inner = lock_hub(&self.hub)?;
    let Some(member) = inner.members.get_mut(&self.id) else {
      return Ok(());
    };
    let Some(meta) = member.tracked.take() else {
      return Ok(());
    };
    let name = member.config.name.clone();
    let leaves = PresenceMap::from([(member.presence_key.clone(), vec![meta])]);

    inner.broadcast(
      &name,
      ChannelEvent::PresenceDiff {
        joins: PresenceMap::new(),
        leaves,
      },
    );
    Ok(())
  }

  async fn leave(&self) -> Result<()> {
    let mut inner = lock_hub(&self.hub)?;
    inner.remove(self.id);
    Ok(())
  }
}
