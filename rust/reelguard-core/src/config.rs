use crate::clock::DayBoundary;
use crate::navigation::{NavigationTiming, MAX_BACK_ATTEMPTS};
use crate::store::{KeyValueStore, KeyringStore, SqliteStore, StoreError};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const CONFIG_FILE: &str = "reelguard.json";
const STORE_FILE: &str = "reelguard.db";
const KEYRING_SERVICE: &str = "reelguard";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReelguardConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageBackend,

    #[serde(default)]
    pub guard: GuardConfig,
}

/// Where persisted state lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// `reelguard.db` in the data directory.
    #[default]
    Sqlite,
    /// The platform credential store.
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
    #[serde(default = "default_block_duration")]
    pub block_duration_ms: u64,
    #[serde(default = "default_back_delay")]
    pub back_action_delay_ms: u64,
    #[serde(default = "default_back_attempts")]
    pub max_back_attempts: u32,
    #[serde(default = "default_settle_delay")]
    pub home_settle_delay_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub event_queue_depth: usize,
    #[serde(default)]
    pub day_boundary: DayBoundary,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
            block_duration_ms: default_block_duration(),
            back_action_delay_ms: default_back_delay(),
            max_back_attempts: default_back_attempts(),
            home_settle_delay_ms: default_settle_delay(),
            event_queue_depth: default_queue_depth(),
            day_boundary: DayBoundary::default(),
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.grace_period_ms == 0 {
            bail!("grace_period_ms must be greater than zero");
        }
        if self.block_duration_ms == 0 {
            bail!("block_duration_ms must be greater than zero");
        }
        if self.back_action_delay_ms == 0 {
            bail!("back_action_delay_ms must be greater than zero");
        }
        if self.home_settle_delay_ms == 0 {
            bail!("home_settle_delay_ms must be greater than zero");
        }
        if !(1..=MAX_BACK_ATTEMPTS).contains(&self.max_back_attempts) {
            bail!(
                "max_back_attempts must be between 1 and {MAX_BACK_ATTEMPTS} (got {})",
                self.max_back_attempts
            );
        }
        if self.event_queue_depth == 0 {
            bail!("event_queue_depth must be greater than zero");
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn navigation_timing(&self) -> NavigationTiming {
        NavigationTiming {
            back_delay: Duration::from_millis(self.back_action_delay_ms),
            max_back_attempts: self.max_back_attempts,
            home_settle_delay: Duration::from_millis(self.home_settle_delay_ms),
        }
    }
}

// Defaults
fn default_grace_period() -> u64 {
    5 * 60 * 1000
}
fn default_block_duration() -> u64 {
    60 * 60 * 1000
}
fn default_back_delay() -> u64 {
    300
}
fn default_back_attempts() -> u32 {
    MAX_BACK_ATTEMPTS
}
fn default_settle_delay() -> u64 {
    500
}
fn default_queue_depth() -> usize {
    256
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("reelguard"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".reelguard")))
        .unwrap_or_else(|| PathBuf::from(".reelguard"))
}

impl ReelguardConfig {
    /// Read `reelguard.json` from `data_dir`, or write and return the
    /// defaults when there is none.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let mut config: ReelguardConfig = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            config.data_dir = data_dir.to_path_buf();
            config.guard.validate()?;
            return Ok(config);
        }

        let config = Self::default_with_dir(data_dir);
        config.persist()?;
        Ok(config)
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            storage: StorageBackend::default(),
            guard: GuardConfig::default(),
        }
    }

    /// The platform default location.
    pub fn default_data_dir() -> PathBuf {
        default_data_dir()
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        let config_path = self.data_dir.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, raw)
            .with_context(|| format!("writing {}", config_path.display()))?;
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    /// Open the configured persistent store.
    pub fn open_store(&self) -> std::result::Result<Arc<dyn KeyValueStore>, StoreError> {
        match self.storage {
            StorageBackend::Sqlite => {
                fs::create_dir_all(&self.data_dir).map_err(|e| {
                    StoreError::Init(format!("creating {}: {e}", self.data_dir.display()))
                })?;
                Ok(Arc::new(SqliteStore::open(self.store_path())?))
            }
            StorageBackend::Keyring => Ok(Arc::new(KeyringStore::new(KEYRING_SERVICE)?)),
        }
    }
}
