use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::chat_delivery_queue::backoff_after;
use crate::error::{ChatError, Result};

const ENV_PREFIX: &str = "CHAT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Seconds between periodic drain passes.
    pub drain_interval_secs: u64,
    /// Upper bound on one transport send.
    pub send_timeout_secs: u64,
    /// Attempts before a message is given up on. 0 retries forever.
    pub max_attempts: u32,
    /// Space retries out with the 5s/15s/45s/2min/5min ladder.
    pub retry_backoff: bool,
    pub max_concurrent_sends: usize,
    /// Max message size in bytes
    pub max_message_size: usize,
    /// Start a drain right after each enqueue.
    pub drain_on_enqueue: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            drain_interval_secs: 5,
            send_timeout_secs: 10,
            max_attempts: 100,
            retry_backoff: true,
            max_concurrent_sends: 4,
            max_message_size: 64 * 1024,
            drain_on_enqueue: true,
        }
    }
}

impl ChatSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Whether a message that has made `attempts` attempts may try again.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Shortest time between a message's first attempt and the moment it is
    /// given up on while the transport stays down. `None` retries forever.
    pub fn retry_window(&self) -> Option<Duration> {
        if self.max_attempts == 0 {
            return None;
        }
        let window = (1..self.max_attempts)
            .map(|attempts| {
                let wait = if self.retry_backoff {
                    backoff_after(attempts)
                } else {
                    Duration::ZERO
                };
                wait.max(self.drain_interval())
            })
            .sum();
        Some(window)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    /// Sub-directory per local identity, so several accounts can share a data dir.
    pub namespace: String,
    pub encrypt_at_rest: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chat-core"),
            namespace: "default".to_string(),
            encrypt_at_rest: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub chat: ChatSettings,
    pub storage: StorageSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chat.drain_interval_secs == 0 {
            return Err(ChatError::ConfigError(
                "chat.drain_interval_secs must be greater than 0".into(),
            ));
        }
        if self.chat.send_timeout_secs == 0 {
            return Err(ChatError::ConfigError(
                "chat.send_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.chat.max_concurrent_sends == 0 {
            return Err(ChatError::ConfigError(
                "chat.max_concurrent_sends must be greater than 0".into(),
            ));
        }
        if self.storage.namespace.is_empty() || self.storage.namespace.contains(['/', '\\']) {
            return Err(ChatError::ConfigError(format!(
                "invalid storage.namespace {:?}",
                self.storage.namespace
            )));
        }
        Ok(())
    }
}

/// Layered configuration: defaults, then the TOML file, then `CHAT__*`
/// environment variables (e.g. `CHAT__CHAT__MAX_ATTEMPTS=10`).
pub struct ConfigService {
    config: AppConfig,
    config_path: PathBuf,
}

impl ConfigService {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-core")
            .join("config.toml")
    }

    pub fn new() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Self::build(path, ENV_PREFIX)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(Self {
            config,
            config_path: path.to_path_buf(),
        })
    }

    fn build(path: &Path, env_prefix: &str) -> Result<AppConfig> {
        let built = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: AppConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn get(&self) -> &AppConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&mut self, config: AppConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(&self.config)
            .map_err(|e| ChatError::ConfigError(format!("Serialize config: {}", e)))?;
        std::fs::write(&self.config_path, contents)?;
        log::info!("Saved configuration to {:?}", self.config_path);
        Ok(())
    }
}
