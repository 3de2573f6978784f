use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::API_BASE;

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
}

/// User settings, re-read at every cycle boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Configured marketplace user id.
    #[serde(default)]
    pub uid: String,
    /// Claim the best study as soon as it is listed.
    #[serde(default)]
    pub autostart: bool,
    /// Seconds between poll cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

fn default_check_interval() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            uid: String::new(),
            autostart: false,
            check_interval: default_check_interval(),
        }
    }
}

impl Settings {
    /// Delay until the next cycle, never shorter than one second.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval.max(1))
    }
}

/// Marketplace connection settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Upper bound for every marketplace request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    API_BASE.to_string()
}

fn default_request_timeout() -> u64 {
    20
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl MarketplaceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Read/write access to the user settings.
pub trait SettingsStore: Send + Sync {
    /// Current settings. Called fresh at every cycle boundary.
    fn load(&self) -> Settings;

    /// Persist an identity learned from traffic as the configured one.
    fn set_uid(&self, uid: &str);
}

/// Settings backed by the TOML config file.
///
/// Every `load` re-reads the file; if it has become unreadable the last good
/// copy is used.
pub struct FileSettings {
    path: PathBuf,
    last_good: Mutex<AppConfig>,
}

impl FileSettings {
    pub fn open(path: &Path) -> Result<Self> {
        let config = AppConfig::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            last_good: Mutex::new(config),
        })
    }

    /// Full config as of the last successful read.
    pub fn config(&self) -> AppConfig {
        self.last_good
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn reload(&self) -> AppConfig {
        let mut last_good = self.last_good.lock().unwrap_or_else(|e| e.into_inner());
        match AppConfig::load(&self.path) {
            Ok(config) => {
                *last_good = config.clone();
                config
            }
            Err(e) => {
                warn!("Keeping previous settings: {e:#}");
                last_good.clone()
            }
        }
    }
}

impl SettingsStore for FileSettings {
    fn load(&self) -> Settings {
        self.reload().settings
    }

    fn set_uid(&self, uid: &str) {
        let mut config = self.reload();
        if config.settings.uid == uid {
            return;
        }
        config.settings.uid = uid.to_string();
        if let Err(e) = config.save(&self.path) {
            warn!("Failed to persist uid: {e:#}");
        }
        *self.last_good.lock().unwrap_or_else(|e| e.into_inner()) = config;
    }
}

/// In-memory settings, for embedding without a config file.
#[derive(Debug, Default)]
pub struct MemorySettings(RwLock<Settings>);

impl MemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self(RwLock::new(settings))
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut settings = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut *settings);
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> Settings {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_uid(&self, uid: &str) {
        self.update(|s| s.uid = uid.to_string());
    }
}
