use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Hosted backend; commands that need the network fail without it
  pub backend: Option<BackendConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub presence: PresenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Project URL, e.g. https://abcd.supabase.co
  pub url: String,
  #[serde(default = "default_schema")]
  pub schema: String,
}

fn default_schema() -> String {
  "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to keep everything in memory only
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// SQLite file (default: $XDG_DATA_HOME/finderid/cache.db)
  pub path: Option<PathBuf>,
  /// Cached data younger than this is served without asking the backend
  #[serde(default = "default_stale_minutes")]
  pub stale_minutes: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      stale_minutes: default_stale_minutes(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_stale_minutes() -> i64 {
  5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
  #[serde(default = "default_heartbeat_secs")]
  pub heartbeat_secs: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      heartbeat_secs: default_heartbeat_secs(),
    }
  }
}

impl RealtimeConfig {
  pub fn heartbeat(&self) -> Duration {
    Duration::from_secs(self.heartbeat_secs.max(1))
  }
}

fn default_heartbeat_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
  #[serde(default = "default_presence_channel")]
  pub channel: String,
  /// How long `presence` waits for the first snapshot
  #[serde(default = "default_sync_timeout_secs")]
  pub sync_timeout_secs: u64,
}

impl Default for PresenceConfig {
  fn default() -> Self {
    Self {
      channel: default_presence_channel(),
      sync_timeout_secs: default_sync_timeout_secs(),
    }
  }
}

fn default_presence_channel() -> String {
  "online-users".to_string()
}

fn default_sync_timeout_secs() -> u64 {
  10
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./finderid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/finderid/config.yaml
  ///
  /// Without any file the defaults apply (cache only, no backend).
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("finderid.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("finderid").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// The configured backend, or an error for commands that need one.
  pub fn backend(&self) -> Result<&BackendConfig> {
    self.backend.as_ref().ok_or_else(|| {
      eyre!(
        "No backend configured. Add a `backend.url` entry to finderid.yaml\n\
                 See finderid.example.yaml for the format."
      )
    })
  }

  /// Get the backend's anonymous API key from environment variables.
  ///
  /// Checks FINDERID_ANON_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_anon_key() -> Result<String> {
    std::env::var("FINDERID_ANON_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set FINDERID_ANON_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Get the signed-in user's access token, if any.
  ///
  /// Checks FINDERID_ACCESS_TOKEN.
  pub fn get_access_token() -> Option<String> {
    std::env::var("FINDERID_ACCESS_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
