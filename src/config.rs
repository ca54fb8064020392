use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_NAMESPACE: &str = "skein-projects";

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub admission: AdmissionConfig,
    pub device: DeviceProfile,
    pub cache: CacheConfig,
}

/// Background write path tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// How long one attempt waits for connectivity before counting as failed
    pub connection_wait_ms: u64,
    /// How long a project stays protected after its remote write concludes
    pub protection_grace_ms: u64,
    /// How long a terminal sync error stays visible
    pub error_display_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connection_wait_ms: 5000,
            protection_grace_ms: 3000,
            error_display_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn connection_wait(&self) -> Duration {
        Duration::from_millis(self.connection_wait_ms)
    }

    pub fn protection_grace(&self) -> Duration {
        Duration::from_millis(self.protection_grace_ms)
    }

    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }
}

/// Cooldowns gating remote change admission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Minimum time since the last successful sync
    pub sync_cooldown_ms: u64,
    /// Minimum time since the last local edit
    pub local_update_cooldown_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            sync_cooldown_ms: 15_000,
            local_update_cooldown_ms: 20_000,
        }
    }
}

impl AdmissionConfig {
    pub fn sync_cooldown(&self) -> Duration {
        Duration::from_millis(self.sync_cooldown_ms)
    }

    pub fn local_update_cooldown(&self) -> Duration {
        Duration::from_millis(self.local_update_cooldown_ms)
    }
}

/// Host-supplied device class tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// First retry delay; doubles on every further retry
    pub base_retry_delay_ms: u64,
    /// Skip the connectivity probe during init
    pub skip_connection_probe: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::desktop()
    }
}

impl DeviceProfile {
    pub fn desktop() -> Self {
        Self {
            base_retry_delay_ms: 1000,
            skip_connection_probe: false,
        }
    }

    /// Flakier radios: longer backoff, and no probe that could stall startup.
    pub fn mobile() -> Self {
        Self {
            base_retry_delay_ms: 2000,
            skip_connection_probe: true,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.base_retry_delay_ms.saturating_mul(factor))
    }
}

/// Snapshot cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key prefix for per-identity snapshots
    pub namespace: String,
    /// redb file path (empty = default data dir)
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            path: None,
        }
    }
}

impl CacheConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(PathBuf::from(path)),
            None => crate::storage::disk::DiskBackend::default_path(),
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("skein");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
