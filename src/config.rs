//! Configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::flow::Verdict;

pub const CONFIG_PATH: &str = "/etc/netto/config.json";

/// Environment variable that overrides [`CONFIG_PATH`].
pub const CONFIG_ENV: &str = "NETTO_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} is a symlink")]
    Symlink(PathBuf),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Verdict applied when no answer arrives in time or the UI is unreachable.
    #[serde(default = "default_verdict")]
    pub default_verdict: Verdict,

    #[serde(default = "default_timeout")]
    pub decision_timeout_secs: u64,

    #[serde(default = "default_capacity")]
    pub event_log_capacity: usize,

    #[serde(default = "default_flush")]
    pub event_flush_secs: u64,

    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,

    #[serde(default = "default_event_log_path")]
    pub event_log_path: PathBuf,

    #[serde(default = "default_ui_socket")]
    pub ui_socket: PathBuf,

    #[serde(default = "default_provider_socket")]
    pub provider_socket: PathBuf,

    #[serde(default)]
    pub trusted_apps: Vec<String>,

    #[serde(default)]
    pub trust_system_apps: bool,
}

fn default_verdict() -> Verdict { Verdict::Allow }
fn default_timeout() -> u64 { 60 }
fn default_capacity() -> usize { 300 }
fn default_flush() -> u64 { 5 }
fn default_policy_path() -> PathBuf { PathBuf::from("/var/lib/netto/policies.json") }
fn default_event_log_path() -> PathBuf { PathBuf::from("/var/lib/netto/events.json") }
fn default_ui_socket() -> PathBuf { PathBuf::from("/var/run/netto/netto-ui.sock") }
fn default_provider_socket() -> PathBuf { PathBuf::from("/var/run/netto/netto-provider.sock") }

impl Default for Config {
    fn default() -> Self {
        Self {
            default_verdict: default_verdict(),
            decision_timeout_secs: default_timeout(),
            event_log_capacity: default_capacity(),
            event_flush_secs: default_flush(),
            policy_path: default_policy_path(),
            event_log_path: default_event_log_path(),
            ui_socket: default_ui_socket(),
            provider_socket: default_provider_socket(),
            trusted_apps: Vec::new(),
            trust_system_apps: false,
        }
    }
}

impl Config {
    pub fn decision_timeout(&self) -> Duration {
        // A zero timeout would resolve every prompt before the UI could see it.
        Duration::from_secs(self.decision_timeout_secs.max(1))
    }

    pub fn event_flush_interval(&self) -> Duration {
        Duration::from_secs(self.event_flush_secs.max(1))
    }

    /// Reads and parses a config file, refusing symlinks.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let metadata = fs::symlink_metadata(path)?;
        if metadata.file_type().is_symlink() {
            return Err(ConfigError::Symlink(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<Config>,
}

impl ConfigManager {
    /// Loads from `$NETTO_CONFIG`, falling back to [`CONFIG_PATH`].
    pub fn new() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
        Self::with_path(path)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let manager = Self {
            path: path.into(),
            config: RwLock::new(Config::default()),
        };
        manager.load();
        manager
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file over the current config. A missing, unreadable or
    /// malformed file leaves the current values in place.
    pub fn load(&self) {
        if !self.path.exists() {
            info!("No config file at {}, using defaults", self.path.display());
            return;
        }

        match Config::from_file(&self.path) {
            Ok(config) => {
                *self.config.write() = config;
                info!("Loaded config from {}", self.path.display());
            }
            Err(ConfigError::Symlink(p)) => {
                warn!("Config file at {} is a symlink, rejecting", p.display());
            }
            Err(e) => {
                warn!("{}, keeping current settings", e);
            }
        }
    }

    pub fn reload(&self) {
        self.load();
    }

    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    pub fn default_verdict(&self) -> Verdict {
        self.config.read().default_verdict
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
