//! Handlers behind the `finderid-sync` subcommands. Results go to stdout as
//! JSON, diagnostics to the log file.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use finderid_sync::cache::{CacheResult, CacheSource, CacheStorage, OfflineCache, PendingQueue};
use finderid_sync::config::Config;
use finderid_sync::domain::{
  Entity, EntityKind, Mcard, McardProduct, McardReview, McardStatus, ReportedCard, UserCard,
};
use finderid_sync::realtime::{
  ChangeFilter, LiveCollection, PhoenixTransport, PresenceRegistry, QueryState, RealtimeTransport,
  SubscriptionManager,
};
use finderid_sync::remote::{AuthSession, RemoteStore, RestClient};
use finderid_sync::sync::{list_selection, SyncContext};

/// What `fetch` looks up.
pub enum FetchTarget {
  List(Option<String>),
  Id(String),
  Key(String),
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::CacheFresh => "cache",
    CacheSource::Offline => "offline",
  }
}

fn rest_client(config: &Config) -> Result<RestClient> {
  let backend = config.backend()?;
  Ok(
    RestClient::new(&backend.url, &Config::get_anon_key()?)?
      .with_schema(&backend.schema)
      .with_access_token(Config::get_access_token()),
  )
}

async fn transport(config: &Config) -> Result<Arc<dyn RealtimeTransport>> {
  let backend = config.backend()?;
  let transport = PhoenixTransport::connect(
    &backend.url,
    &Config::get_anon_key()?,
    Config::get_access_token(),
    config.realtime.heartbeat(),
  )
  .await?;
  Ok(Arc::new(transport))
}

fn sync_context<S: CacheStorage>(config: &Config, storage: Arc<S>) -> Result<SyncContext<S>> {
  let remote: Arc<dyn RemoteStore> = Arc::new(rest_client(config)?);
  Ok(
    SyncContext::new(storage, remote)
      .with_stale_time(chrono::Duration::minutes(config.cache.stale_minutes)),
  )
}

pub fn cache_list<S: CacheStorage>(
  storage: Arc<S>,
  kind: Option<EntityKind>,
  parent: Option<&str>,
) -> Result<()> {
  let cache = OfflineCache::new(storage);
  let kinds = match kind {
    Some(kind) => vec![kind],
    None => EntityKind::ALL.to_vec(),
  };

  let mut listing = serde_json::Map::new();
  for kind in kinds {
    let records = cache.records(kind.collection(), parent)?;
    listing.insert(kind.to_string(), Value::Array(records));
  }

  print_json(&json!({
    "last_sync": cache.last_sync()?,
    "records": listing,
  }))
}

pub fn cache_get<S: CacheStorage>(storage: Arc<S>, kind: EntityKind, id: &str) -> Result<()> {
  let cache = OfflineCache::new(storage);
  let record = cache
    .get_record(kind.collection(), id)?
    .ok_or_else(|| eyre!("No cached {} with id {}", kind, id))?;
  print_json(&record)
}

pub fn cache_clear<S: CacheStorage>(storage: Arc<S>) -> Result<()> {
  let cache = OfflineCache::new(storage);
  let queue = PendingQueue::for_cache(&cache);
  let dropped = queue.len()?;
  cache.clear_all()?;
  info!(dropped, "Pending changes dropped with the cache");
  info!("Offline cache cleared");
  println!("Offline cache cleared");
  Ok(())
}

pub fn pending_list<S: CacheStorage>(storage: Arc<S>) -> Result<()> {
  print_json(&PendingQueue::new(storage).list()?)
}

pub fn pending_clear<S: CacheStorage>(storage: Arc<S>) -> Result<()> {
  let queue = PendingQueue::new(storage);
  let dropped = queue.len()?;
  queue.clear()?;
  info!(dropped, "Pending changes cleared");
  println!("Dropped {} pending change(s)", dropped);
  Ok(())
}

fn envelope<T: Serialize>(kind: EntityKind, result: CacheResult<T>) -> Result<Value> {
  let data =
    serde_json::to_value(&result.data).map_err(|e| eyre!("Failed to encode {}: {}", kind, e))?;
  Ok(json!({
    "kind": kind,
    "source": source_label(result.source),
    "cached_at": result.cached_at,
    "data": data,
  }))
}

async fn fetch_entity<T: Entity, S: CacheStorage>(
  ctx: &SyncContext<S>,
  target: FetchTarget,
) -> Result<Value> {
  let repo = ctx.repository::<T>();
  match target {
    FetchTarget::List(parent) => envelope(T::KIND, repo.fetch_list(parent.as_deref()).await?),
    FetchTarget::Id(id) => envelope(T::KIND, repo.fetch_one(&id).await?),
    FetchTarget::Key(key) => match repo.fetch_by_secondary_key(&key).await? {
      Some(result) => envelope(T::KIND, result),
      None => Err(eyre!("No {} with key {}", T::KIND, key)),
    },
  }
}

pub async fn fetch<S: CacheStorage>(
  config: &Config,
  storage: Arc<S>,
  kind: EntityKind,
  target: FetchTarget,
) -> Result<()> {
  let ctx = sync_context(config, storage)?;
  let output = match kind {
    EntityKind::Mcard => fetch_entity::<Mcard, S>(&ctx, target).await?,
    EntityKind::Status => fetch_entity::<McardStatus, S>(&ctx, target).await?,
    EntityKind::Product => fetch_entity::<McardProduct, S>(&ctx, target).await?,
    EntityKind::Review => fetch_entity::<McardReview, S>(&ctx, target).await?,
    EntityKind::ReportedCard => fetch_entity::<ReportedCard, S>(&ctx, target).await?,
    EntityKind::UserCard => fetch_entity::<UserCard, S>(&ctx, target).await?,
  };
  print_json(&output)
}

pub async fn sync<S: CacheStorage>(config: &Config, storage: Arc<S>) -> Result<()> {
  let ctx = sync_context(config, storage)?;
  let report = ctx.replay().await?;

  let conflicts: Vec<Value> = report
    .conflicts
    .iter()
    .map(|c| json!({ "change": c.change, "remote": c.remote }))
    .collect();
  let rejected: Vec<Value> = report
    .rejected
    .iter()
    .map(|r| json!({ "change": r.change, "reason": r.reason }))
    .collect();
  print_json(&json!({
    "applied": report.applied.len(),
    "conflicts": conflicts,
    "dropped": report.dropped,
    "rejected": rejected,
    "remaining": report.remaining,
    "failure": report.failure,
  }))?;

  match report.failure {
    Some(failure) => Err(eyre!("Replay stopped early: {}", failure)),
    None => Ok(()),
  }
}

pub async fn watch<S: CacheStorage>(
  config: &Config,
  storage: Arc<S>,
  kind: EntityKind,
  parent: Option<String>,
) -> Result<()> {
  let remote: Arc<dyn RemoteStore> = Arc::new(rest_client(config)?);
  let manager = SubscriptionManager::new(transport(config).await?);
  let cache = OfflineCache::new(storage);

  let collection = kind.collection();
  let parent = parent.filter(|_| collection.is_grouped());
  let selection = list_selection(kind, parent.as_deref());

  let mut filter = ChangeFilter::table(kind.table());
  filter.schema = config.backend()?.schema.clone();
  if let (Some(column), Some(parent)) = (collection.parent_column, parent.as_deref()) {
    filter = filter.eq(column, parent);
  }

  let mut live = LiveCollection::new(&manager, filter, move || {
    let remote = Arc::clone(&remote);
    let selection = selection.clone();
    async move { remote.select(&selection).await.map_err(|e| e.to_string()) }
  });

  loop {
    tokio::select! {
      _ = live.changed() => {}
      _ = tokio::signal::ctrl_c() => break,
    }

    match live.state() {
      QueryState::Success(rows) => {
        cache.replace_records(collection, parent.as_deref(), rows.clone())?;
        print_json(&json!({
          "kind": kind,
          "refetches": live.refetch_count(),
          "rows": rows,
        }))?;
      }
      QueryState::Error(e) => eprintln!("Fetch failed: {}", e),
      QueryState::Idle | QueryState::Loading => {}
    }
  }

  live.close().await;
  Ok(())
}

pub async fn presence(config: &Config, users: Vec<String>, track: Option<String>) -> Result<()> {
  let registry = PresenceRegistry::new(transport(config).await?, &config.presence.channel);

  let mut watches = Vec::with_capacity(users.len());
  for user in users {
    let label = user.clone();
    watches.push(
      registry
        .watch(&user, move |online| {
          println!("{}", json!({ "user": label, "online": online }));
        })
        .await?,
    );
  }

  let ticket = match track {
    Some(user) => Some(registry.track_self(&user).await?),
    None => None,
  };

  let timeout = Duration::from_secs(config.presence.sync_timeout_secs);
  match tokio::time::timeout(timeout, registry.wait_synced()).await {
    Ok(synced) => {
      synced?;
      print_json(&json!({ "online": registry.online_users() }))?;
    }
    Err(_) => eprintln!(
      "No presence snapshot after {}s, still waiting",
      config.presence.sync_timeout_secs
    ),
  }

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;

  if let Some(ticket) = ticket {
    ticket.untrack().await;
  }
  for watch in watches {
    watch.unsubscribe().await;
  }
  Ok(())
}

pub async fn whoami(config: &Config) -> Result<()> {
  match rest_client(config)?.get_user().await? {
    Some(user) => print_json(&user),
    None => Err(eyre!(
      "Not signed in. Set FINDERID_ACCESS_TOKEN to a valid session token."
    )),
  }
}
