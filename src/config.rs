//! Configuration for taskloom.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordination::gate::GateConfig;
use crate::coordination::scheduler::SchedulerConfig;
use crate::error::Error;
use crate::pool::PoolConfig;
use crate::store::kv::StoreConfig;

/// Taskloom configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the store database and logs.
    pub data_dir: PathBuf,
    /// Access gate settings.
    pub gate: GateSettings,
    /// Key-value store settings.
    pub store: StoreSettings,
    /// Scheduler settings.
    pub scheduler: SchedulerSettings,
    /// Worker pool settings.
    pub pool: PoolSettings,
    /// Executor settings.
    pub executor: ExecutorSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taskloom");

        Self {
            data_dir,
            gate: GateSettings::default(),
            store: StoreSettings::default(),
            scheduler: SchedulerSettings::default(),
            pool: PoolSettings::default(),
            executor: ExecutorSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/taskloom/taskloom.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("taskloom").join("taskloom.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./taskloom.yml
        let fallback_config = PathBuf::from("taskloom.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> crate::Result<()> {
        if self.gate.max_concurrent == 0 {
            return Err(Error::Config("gate.max_concurrent must be at least 1".into()));
        }
        if self.store.capacity == 0 {
            return Err(Error::Config("store.capacity must be at least 1".into()));
        }
        if self.store.shards == 0 {
            return Err(Error::Config("store.shards must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.store.eviction_jitter) {
            return Err(Error::Config(format!(
                "store.eviction_jitter must be in [0, 1), got {}",
                self.store.eviction_jitter
            )));
        }
        if self.scheduler.aging_threshold_ms == 0 {
            return Err(Error::Config("scheduler.aging_threshold_ms must be non-zero".into()));
        }
        PoolConfig::from(&self.pool)
            .validate()
            .map_err(|e| Error::Config(format!("pool: {e}")))?;
        Ok(())
    }

    /// Get the store database path.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("taskloom.db")
    }

    /// Get the log directory.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Access gate settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateSettings {
    /// Maximum concurrent store mutations.
    pub max_concurrent: usize,
    /// How long a store mutation waits for admission (milliseconds).
    pub acquire_timeout_ms: u64,
    /// Lease after which an unreleased token is reclaimed (seconds, 0 = never).
    pub token_lease_secs: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            acquire_timeout_ms: 5_000,
            token_lease_secs: 30,
        }
    }
}

impl From<&GateSettings> for GateConfig {
    fn from(settings: &GateSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            token_lease: (settings.token_lease_secs > 0).then(|| Duration::from_secs(settings.token_lease_secs)),
        }
    }
}

/// Key-value store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Maximum live entries.
    #[serde(alias = "store_capacity")]
    pub capacity: usize,
    /// Default time to live for entries (seconds, none = never expire).
    pub default_ttl_secs: Option<u64>,
    /// Expiry sweep period (milliseconds).
    pub sweep_interval_ms: u64,
    /// Upper bound of eviction score jitter.
    pub eviction_jitter: f64,
    /// Number of lock shards.
    pub shards: usize,
    /// Persist entries to `<data_dir>/taskloom.db`.
    pub persist: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl_secs: None,
            sweep_interval_ms: 1_000,
            eviction_jitter: 0.02,
            shards: 16,
            persist: true,
        }
    }
}

impl From<&Config> for StoreConfig {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.store.capacity,
            default_ttl: config.store.default_ttl_secs.map(Duration::from_secs),
            shards: config.store.shards,
            acquire_timeout: Duration::from_millis(config.gate.acquire_timeout_ms),
            sweep_interval: Duration::from_millis(config.store.sweep_interval_ms),
            eviction_jitter: config.store.eviction_jitter,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Wait after which a queued task is promoted one level (milliseconds).
    pub aging_threshold_ms: u64,
    /// Maximum queued tasks (none = unbounded).
    pub max_queue: Option<usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            aging_threshold_ms: 5_000,
            max_queue: None,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            aging_threshold: Duration::from_millis(settings.aging_threshold_ms),
            max_queue: settings.max_queue,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub sampling_interval_ms: u64,
    pub sampling_window_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub idle_poll_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            min_workers: defaults.min_workers,
            max_workers: defaults.max_workers,
            sampling_interval_ms: defaults.sampling_interval.as_millis() as u64,
            sampling_window_size: defaults.sampling_window_size,
            scale_up_threshold: defaults.scale_up_threshold,
            scale_down_threshold: defaults.scale_down_threshold,
            idle_poll_ms: defaults.idle_poll.as_millis() as u64,
            shutdown_grace_ms: defaults.shutdown_grace.as_millis() as u64,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            min_workers: settings.min_workers,
            max_workers: settings.max_workers,
            sampling_interval: Duration::from_millis(settings.sampling_interval_ms),
            sampling_window_size: settings.sampling_window_size,
            scale_up_threshold: settings.scale_up_threshold,
            scale_down_threshold: settings.scale_down_threshold,
            idle_poll: Duration::from_millis(settings.idle_poll_ms),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// How long finished, unconsumed task records are retained (seconds).
    pub retention_secs: u64,
    /// Period of the record purge loop (milliseconds).
    pub maintenance_interval_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            retention_secs: 3_600,
            maintenance_interval_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gate.max_concurrent, 8);
        assert_eq!(config.store.capacity, 10_000);
        assert_eq!(config.scheduler.aging_threshold_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_paths() {
        let config = Config {
            data_dir: PathBuf::from("/tmp/test"),
            ..Default::default()
        };

        assert_eq!(config.database_path(), PathBuf::from("/tmp/test/taskloom.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/test/logs"));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yml");

        let config_content = r#"
data_dir: /custom/path
gate:
  max_concurrent: 2
  token_lease_secs: 0
store:
  store_capacity: 64
  default_ttl_secs: 120
  persist: false
scheduler:
  aging_threshold_ms: 250
  max_queue: 1000
pool:
  min_workers: 2
  max_workers: 6
executor:
  retention_secs: 60
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/path"));
        assert_eq!(config.gate.max_concurrent, 2);
        assert_eq!(config.store.capacity, 64);
        assert_eq!(config.store.default_ttl_secs, Some(120));
        assert!(!config.store.persist);
        assert_eq!(config.scheduler.max_queue, Some(1000));
        assert_eq!(config.pool.max_workers, 6);
        assert_eq!(config.executor.retention_secs, 60);
        // Unspecified keys keep their defaults
        assert_eq!(config.store.shards, 16);
        assert_eq!(config.executor.maintenance_interval_ms, 30_000);

        let gate = GateConfig::from(&config.gate);
        assert_eq!(gate.token_lease, None);
        let store = StoreConfig::from(&config);
        assert_eq!(store.default_ttl, Some(Duration::from_secs(120)));
        assert_eq!(SchedulerConfig::from(&config.scheduler).aging_threshold, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_file_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yml");
        fs::write(&config_path, "pool:\n  min_workers: 5\n  max_workers: 2\n").unwrap();

        assert!(Config::load_from_file(&config_path).is_err());
        assert!(Config::load(Some(&config_path)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = Config::default();
        config.gate.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.store.eviction_jitter = 2.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.scale_down_threshold = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_when_no_config() {
        let config = Config::load(None).unwrap();
        assert!(config.validate().is_ok());
    }
}
