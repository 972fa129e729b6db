mod commands;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;

use finderid_sync::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use finderid_sync::config::Config;
use finderid_sync::domain::EntityKind;
use finderid_sync::logging;

#[derive(Parser, Debug)]
#[command(name = "finderid-sync")]
#[command(about = "Offline cache and realtime sync for FinderID and MCard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/finderid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for log files (default: $XDG_DATA_HOME/finderid/logs)
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Inspect or wipe the offline cache
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Inspect or drop changes waiting for replay
  #[command(subcommand)]
  Pending(PendingCommand),

  /// Fetch through the cache, falling back to it when offline
  Fetch {
    kind: EntityKind,
    /// Only records under this parent (MCard id, user id)
    #[arg(long)]
    parent: Option<String>,
    /// A single record by id
    #[arg(long, conflicts_with_all = ["parent", "key"])]
    id: Option<String>,
    /// A single record by slug or card number
    #[arg(long, conflicts_with = "parent")]
    key: Option<String>,
  },

  /// Replay queued changes against the backend
  Sync,

  /// Print a collection every time it changes remotely
  Watch {
    kind: EntityKind,
    #[arg(long)]
    parent: Option<String>,
  },

  /// Report when users come online or go offline
  Presence {
    #[arg(required = true)]
    users: Vec<String>,
    /// Announce this user as online while watching
    #[arg(long)]
    track: Option<String>,
  },

  /// Show the signed-in user
  Whoami,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Cached records, for one kind or all of them
  List {
    kind: Option<EntityKind>,
    #[arg(long)]
    parent: Option<String>,
  },
  /// One cached record
  Get { kind: EntityKind, id: String },
  /// Remove every cached record, queued change and sync marker
  Clear,
}

#[derive(Subcommand, Debug)]
enum PendingCommand {
  List,
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  let _log_guard = match args.log_dir.or_else(logging::default_log_dir) {
    Some(dir) => Some(logging::init(&dir)?),
    None => None,
  };

  if config.cache.enabled {
    let storage = match &config.cache.path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    run(args.command, &config, Arc::new(storage)).await
  } else {
    run(args.command, &config, Arc::new(MemoryStorage::new())).await
  }
}

async fn run<S: CacheStorage + 'static>(command: Command, config: &Config, storage: Arc<S>) -> Result<()> {
  match command {
    Command::Cache(CacheCommand::List { kind, parent }) => {
      commands::cache_list(storage, kind, parent.as_deref())
    }
    Command::Cache(CacheCommand::Get { kind, id }) => commands::cache_get(storage, kind, &id),
    Command::Cache(CacheCommand::Clear) => commands::cache_clear(storage),
    Command::Pending(PendingCommand::List) => commands::pending_list(storage),
    Command::Pending(PendingCommand::Clear) => commands::pending_clear(storage),
    Command::Fetch {
      kind,
      parent,
      id,
      key,
    } => {
      let target = match (id, key) {
        (Some(id), _) => commands::FetchTarget::Id(id),
        (None, Some(key)) => commands::FetchTarget::Key(key),
        (None, None) => commands::FetchTarget::List(parent),
      };
      commands::fetch(config, storage, kind, target).await
    }
    Command::Sync => commands::sync(config, storage).await,
    Command::Watch { kind, parent } => commands::watch(config, storage, kind, parent).await,
    Command::Presence { users, track } => commands::presence(config, users, track).await,
    Command::Whoami => commands::whoami(config).await,
  }
}
