//! Bridges server-pushed row changes to refresh callbacks.
//!
//! Each `subscribe` call joins its own channel; overlapping filters are not
//! deduplicated. The callback only learns that something changed and is
//! expected to refetch the affected collection.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{
  Channel, ChangeEvent, ChangeFilter, ChannelConfig, ChannelEvent, ChannelStatus,
  RealtimeTransport,
};

/// Lifecycle of one subscription. `Unsubscribed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
  Created,
  Subscribing,
  Active,
  Unsubscribed,
}

type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Opens one channel per subscription on a shared transport.
#[derive(Clone)]
pub struct SubscriptionManager {
  transport: Arc<dyn RealtimeTransport>,
}

impl SubscriptionManager {
  pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
    Self { transport }
  }

  /// Call `on_change` for every change matching `filter` until the returned
  /// subscription is unsubscribed or dropped.
  pub fn subscribe<F>(&self, filter: ChangeFilter, on_change: F) -> Subscription
  where
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
  {
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Created);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let name = filter.channel_name();

    let task = tokio::spawn(run_subscription(
      Arc::clone(&self.transport),
      filter.clone(),
      Arc::new(on_change),
      state_tx,
      shutdown_rx,
    ));

    Subscription {
      name,
      filter,
      state: state_rx,
      shutdown: Some(shutdown_tx),
      task: Some(task),
    }
  }
}

/// Handle to a live subscription. Dropping it unsubscribes.
pub struct Subscription {
  name: String,
  filter: ChangeFilter,
  state: watch::Receiver<SubscriptionState>,
  shutdown: Option<oneshot::Sender<()>>,
  task: Option<JoinHandle<()>>,
}

impl Subscription {
  pub fn state(&self) -> SubscriptionState {
    *self.state.borrow()
  }

  pub fn filter(&self) -> &ChangeFilter {
    &self.filter
  }

  /// Channel name this subscription joined.
  pub fn channel_name(&self) -> &str {
    &self.name
  }

  /// Wait until the server acknowledged the subscription.
  ///
  /// Fails if the subscription ended before becoming active.
  pub async fn wait_active(&mut self) -> Result<()> {
    let state = self
      .state
      .wait_for(|s| matches!(s, SubscriptionState::Active | SubscriptionState::Unsubscribed))
      .await
      .map(|s| *s)
      .unwrap_or(SubscriptionState::Unsubscribed);

    match state {
      SubscriptionState::Active => Ok(()),
      _ => Err(eyre!("Subscription {} ended before becoming active", self.name)),
    }
  }

  /// Leave the channel and wait for the subscription to wind down.
  pub async fn unsubscribe(mut self) {
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(());
    }
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    // Dropping the sender wakes the task just like an explicit shutdown.
    self.shutdown.take();
  }
}

async fn run_subscription(
  transport: Arc<dyn RealtimeTransport>,
  filter: ChangeFilter,
  on_change: ChangeCallback,
  state: watch::Sender<SubscriptionState>,
  mut shutdown: oneshot::Receiver<()>,
) {
  state.send_replace(SubscriptionState::Subscribing);

  let config = ChannelConfig {
    name: filter.channel_name(),
    changes: vec![filter.clone()],
    presence_key: None,
  };

  let joined = tokio::select! {
    joined = transport.join(config) => joined,
    _ = &mut shutdown => {
      state.send_replace(SubscriptionState::Unsubscribed);
      return;
    }
  };

  let Channel {
    topic,
    mut events,
    control,
  } = match joined {
    Ok(channel) => channel,
    Err(e) => {
      warn!(filter = %filter, error = %e, "Failed to join change channel");
      state.send_replace(SubscriptionState::Unsubscribed);
      return;
    }
  };

  loop {
    tokio::select! {
      _ = &mut shutdown => break,
      event = events.recv() => match event {
        Some(ChannelEvent::Status(ChannelStatus::Joined)) => {
          info!(topic = %topic, filter = %filter, "Subscription active");
          state.send_replace(SubscriptionState::Active);
        }
        Some(ChannelEvent::Status(ChannelStatus::Closed)) => {
          debug!(topic = %topic, "Change channel closed");
          break;
        }
        Some(ChannelEvent::Status(ChannelStatus::Errored(reason))) => {
          warn!(topic = %topic, reason = %reason, "Change channel errored");
          break;
        }
        Some(ChannelEvent::Change(change)) => {
          if filter.matches(&change) {
            on_change(&change);
          }
        }
        Some(_) => {}
        None => break,
      }
    }
  }

  if let Err(e) = control.leave().await {
    debug!(topic = %topic, error = %e, "Leaving change channel failed");
  }
  state.send_replace(SubscriptionState::Unsubscribed);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::realtime::channel::ChangeKind;
  use crate::realtime::hub::LocalHub;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn status_insert(id: &str, mcard: &str) -> ChangeEvent {
    ChangeEvent::new(
      "mcard_statuses",
      ChangeKind::Insert,
      json!({"id": id, "mcard_id": mcard}),
    )
  }

  async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
      if check() {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
  }

  #[tokio::test]
  async fn test_lifecycle() {
    let hub = LocalHub::new();
    let manager = SubscriptionManager::new(Arc::new(hub.client()));

    let mut sub = manager.subscribe(ChangeFilter::table("mcard_statuses"), |_| {});
    sub.wait_active().await.unwrap();
    assert_eq!(sub.state(), SubscriptionState::Active);
    assert_eq!(hub.open_channels(), 1);

    sub.unsubscribe().await;
    assert_eq!(hub.open_channels(), 0);
    assert_eq!(hub.channels_closed(), 1);
  }

  #[tokio::test]
  async fn test_drop_unsubscribes() {
    let hub = LocalHub::new();
    let manager = SubscriptionManager::new(Arc::new(hub.client()));

    let mut sub = manager.subscribe(ChangeFilter::table("mcard_statuses"), |_| {});
    sub.wait_active().await.unwrap();
    drop(sub);

    assert!(eventually(|| hub.open_channels() == 0).await);
  }

  #[tokio::test]
  async fn test_callback_fires_after_last_event() {
    let hub = LocalHub::new();
    let manager = SubscriptionManager::new(Arc::new(hub.client()));
    let calls = Arc::new(AtomicUsize::new(0));
    let last_seen = Arc::new(std::sync::Mutex::new(None::<String>));

    let calls_cb = calls.clone();
    let last_cb = last_seen.clone();
    let mut sub = manager.subscribe(
      ChangeFilter::table("mcard_statuses").eq("mcard_id", "m1"),
      move |change| {
        calls_cb.fetch_add(1, Ordering::SeqCst);
        *last_cb.lock().unwrap() = change.record["id"].as_str().map(String::from);
      },
    );
    sub.wait_active().await.unwrap();

    for i in 0..5 {
      hub.publish_change(status_insert(&format!("s{}", i), "m1"));
      hub.publish_change(status_insert(&format!("x{}", i), "m2"));
    }

    assert!(eventually(|| calls.load(Ordering::SeqCst) >= 5).await);
    assert_eq!(last_seen.lock().unwrap().as_deref(), Some("s4"));
  }

  #[tokio::test]
  async fn test_overlapping_subscriptions_are_independent() {
    let hub = LocalHub::new();
    let manager = SubscriptionManager::new(Arc::new(hub.client()));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut subs = Vec::new();
    for _ in 0..2 {
      let calls = calls.clone();
      let mut sub = manager.subscribe(ChangeFilter::table("mcard_statuses"), move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
      });
      sub.wait_active().await.unwrap();
      subs.push(sub);
    }
    assert_eq!(hub.open_channels(), 2);

    hub.publish_change(status_insert("s1", "m1"));
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 2).await);

    let first = subs.remove(0);
    first.unsubscribe().await;
    hub.publish_change(status_insert("s2", "m1"));
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 3).await);
  }

  #[tokio::test]
  async fn test_server_close_ends_subscription() {
    let hub = LocalHub::new();
    let client = hub.client();
    let manager = SubscriptionManager::new(Arc::new(client.clone()));

    let mut sub = manager.subscribe(ChangeFilter::table("mcards"), |_| {});
    sub.wait_active().await.unwrap();

    hub.disconnect(&client);
    assert!(eventually(|| sub.state() == SubscriptionState::Unsubscribed).await);
  }
}
