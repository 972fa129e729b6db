//! Refresh-by-refetch collections.
//!
//! A [`LiveCollection`] pairs a change subscription with an async [`Query`].
//! Change events never patch the data; they only mark it dirty, and the next
//! poll refetches the whole collection. A refetch supersedes any refetch
//! still in flight, so a slow earlier response can never overwrite a newer
//! one.
//!
//! # Example
//!
//! ```ignore
//! let remote = remote.clone();
//! let mut statuses = LiveCollection::new(
//!   &manager,
//!   ChangeFilter::table("mcard_statuses").eq("mcard_id", &mcard_id),
//!   move || {
//!     let remote = remote.clone();
//!     async move { remote.select(&selection).await.map_err(|e| e.to_string()) }
//!   },
//! );
//!
//! // In event loop tick
//! if statuses.poll() {
//!   render(statuses.state());
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

use super::channel::ChangeFilter;
use super::subscription::{Subscription, SubscriptionManager};

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// First fetch in flight, no data yet
  Loading,
  /// Latest fetch completed successfully
  Success(T),
  /// Latest fetch failed
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Async query whose newest fetch always wins.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, String>>>,
  fetched_at: Option<Instant>,
  in_flight: bool,
}

impl<T: Send + 'static> Query<T> {
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      fetched_at: None,
      in_flight: false,
    }
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  /// Whether a fetch is in flight. Previous data stays visible meanwhile.
  pub fn is_fetching(&self) -> bool {
    self.in_flight
  }

  /// When the current data arrived.
  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  /// Start fetching unless a fetch is already in flight.
  pub fn fetch(&mut self) {
    if self.in_flight {
      return;
    }
    self.start_fetch();
  }

  /// Start a new fetch, abandoning any fetch in flight.
  pub fn refetch(&mut self) {
    // Dropping the receiver discards the older fetch's result.
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return false;
    };

    let outcome = match receiver.try_recv() {
      Ok(result) => result,
      Err(mpsc::error::TryRecvError::Empty) => return false,
      Err(mpsc::error::TryRecvError::Disconnected) => Err("Query was cancelled".to_string()),
    };

    self.receiver = None;
    self.in_flight = false;
    match outcome {
      Ok(data) => {
        self.state = QueryState::Success(data);
        self.fetched_at = Some(Instant::now());
      }
      Err(error) => self.state = QueryState::Error(error),
    }
    true
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.in_flight = true;
    if matches!(self.state, QueryState::Idle) {
      self.state = QueryState::Loading;
    }

    let future = (self.fetcher)();
    tokio::spawn(async move {
      // Receiver may have been dropped by a newer refetch.
      let _ = tx.send(future.await);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .field("in_flight", &self.in_flight)
      .finish_non_exhaustive()
  }
}

/// A collection kept current by refetching on every matching change.
pub struct LiveCollection<T> {
  query: Query<T>,
  dirty: mpsc::UnboundedReceiver<()>,
  subscription: Subscription,
  refetches: u64,
  tick: Duration,
}

impl<T: Send + 'static> LiveCollection<T> {
  /// Subscribe to `filter` and start the initial fetch.
  pub fn new<F, Fut>(manager: &SubscriptionManager, filter: ChangeFilter, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let (dirty_tx, dirty) = mpsc::unbounded_channel();
    let subscription = manager.subscribe(filter, move |_| {
      let _ = dirty_tx.send(());
    });

    let mut query = Query::new(fetcher);
    query.fetch();

    Self {
      query,
      dirty,
      subscription,
      refetches: 0,
      tick: Duration::from_millis(50),
    }
  }

  /// How often `changed` polls.
  pub fn with_tick(mut self, tick: Duration) -> Self {
    self.tick = tick;
    self
  }

  /// Refetch once if any change arrived since the last poll, then collect
  /// fetch results. Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let mut changes = 0;
    while self.dirty.try_recv().is_ok() {
      changes += 1;
    }
    if changes > 0 {
      self.refetches += 1;
      debug!(
        filter = %self.subscription.filter(),
        changes,
        "Refetching after change notification"
      );
      self.query.refetch();
    }
    self.query.poll()
  }

  /// Wait until the next state change.
  pub async fn changed(&mut self) {
    while !self.poll() {
      tokio::time::sleep(self.tick).await;
    }
  }

  pub fn state(&self) -> &QueryState<T> {
    self.query.state()
  }

  pub fn data(&self) -> Option<&T> {
    self.query.data()
  }

  /// Refetches triggered by change notifications so far.
  pub fn refetch_count(&self) -> u64 {
    self.refetches
  }

  pub fn subscription(&self) -> &Subscription {
    &self.subscription
  }

  pub fn subscription_mut(&mut self) -> &mut Subscription {
    &mut self.subscription
  }

  /// Stop listening for changes.
  pub async fn close(self) {
    self.subscription.unsubscribe().await;
  }
}
