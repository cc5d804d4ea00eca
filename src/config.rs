use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub gateway: GatewayConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub breaker: BreakerConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub debounce: DebounceConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
  /// Base URL of the RPC endpoint; calls go to `<url>/rpc/<name>`
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_secs: u64,
  /// How often expired entries are swept from both tiers
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 300,
      sweep_interval_secs: 300,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub exponential: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay_ms: 1000,
      max_delay_ms: 10_000,
      exponential: true,
    }
  }
}

impl RetryConfig {
  /// Upper bound on a single backoff delay
  pub fn max_delay(&self) -> Duration {
    Duration::from_millis(self.max_delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
  /// Consecutive exhausted calls before the circuit opens
  pub threshold: u32,
  pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      threshold: 5,
      cooldown_secs: 60,
    }
  }
}

impl BreakerConfig {
  pub fn cooldown(&self) -> Duration {
    Duration::from_secs(self.cooldown_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// Queued changes older than this are discarded
  pub retention_hours: u64,
  /// Interval of the background sync while online
  pub auto_sync_secs: u64,
  /// Read operations whose cached results are dropped on every background sync
  pub refresh_reads: Vec<String>,
  /// Ask the remote to validate its data on every background sync
  pub integrity_check: bool,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      retention_hours: 24,
      auto_sync_secs: 30,
      refresh_reads: vec![
        "getActiveClientsCount".into(),
        "getRecentSessions".into(),
        "getUserPreferences".into(),
      ],
      integrity_check: true,
    }
  }
}

impl OfflineConfig {
  pub fn retention(&self) -> Duration {
    Duration::from_secs(self.retention_hours * 60 * 60)
  }

  pub fn auto_sync_interval(&self) -> Duration {
    Duration::from_secs(self.auto_sync_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  /// How long probes must keep failing before we declare offline
  pub grace_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
      grace_ms: 2000,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn grace(&self) -> Duration {
    Duration::from_millis(self.grace_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
  pub search_ms: u64,
  pub autosave_ms: u64,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      search_ms: 300,
      autosave_ms: 2000,
    }
  }
}

impl DebounceConfig {
  pub fn search(&self) -> Duration {
    Duration::from_millis(self.search_ms)
  }

  pub fn autosave(&self) -> Duration {
    Duration::from_millis(self.autosave_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Upper bound on stored bytes; writes beyond it fail with a quota error
  pub quota_bytes: Option<u64>,
}

impl Config {
  /// Configuration with every tunable at its default, pointing at `url`.
  pub fn with_gateway(url: impl Into<String>) -> Self {
    Self {
      gateway: GatewayConfig { url: url.into() },
      cache: CacheConfig::default(),
      retry: RetryConfig::default(),
      breaker: BreakerConfig::default(),
      offline: OfflineConfig::default(),
      connectivity: ConnectivityConfig::default(),
      debounce: DebounceConfig::default(),
      storage: StorageConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tutordesk.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tutordesk/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tutordesk/config.yaml\n\
                 with at least a `gateway.url` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tutordesk.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tutordesk").join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tutordesk"))
  }
}
