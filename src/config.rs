//! Relay configuration
//!
//! Loaded once at startup from a TOML file. Missing keys fall back to defaults, and
//! a missing file is created with the defaults so there is something to edit.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONFIG_ENV_VAR: &str = "MQTT_RELAY_CONFIG";
const CONFIG_DIR: &str = "mqtt-relay";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Token every inbound directive starts with, e.g. `/mqtt subscribe a/b`.
    /// Empty means directives are not prefixed.
    pub command_prefix: String,
    /// Generated client ids look like `<prefix>_<8 hex chars>`
    pub client_id_prefix: String,
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request channel
    pub request_channel_capacity: usize,
    /// Capacity of the broker event channel feeding the fan-out
    pub event_channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            command_prefix: "/mqtt".to_string(),
            client_id_prefix: "mqtt_relay".to_string(),
            connect_timeout_secs: 10,
            keep_alive_secs: 30,
            request_channel_capacity: 100,
            event_channel_capacity: 1000,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// `$MQTT_RELAY_CONFIG` if set, otherwise `<config dir>/mqtt-relay/config.toml`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse relay config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_secs == 0 {
            return Err(eyre!("connect_timeout_secs must be at least 1"));
        }
        if self.keep_alive_secs < 5 {
            return Err(eyre!("keep_alive_secs must be at least 5"));
        }
        if self.request_channel_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(eyre!("channel capacities must be greater than 0"));
        }
        if self.client_id_prefix.is_empty() {
            return Err(eyre!("client_id_prefix must not be empty"));
        }
        if self.command_prefix.chars().any(char::is_whitespace) {
            return Err(eyre!(
                "command_prefix `{}` must not contain whitespace",
                self.command_prefix
            ));
        }
        Ok(())
    }

    /// Reads the config at `path`, writing the defaults there first if it is missing
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!("No config at {}, writing defaults", path.display());
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded relay config from {}", path.display());
        debug!("Relay config: {:?}", config);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize relay config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = RelayConfig::from_toml("command_prefix = \"!mq\"\nconnect_timeout_secs = 3")
            .unwrap();
        assert_eq!(config.command_prefix, "!mq");
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.keep_alive_secs, 30);
        assert_eq!(config.client_id_prefix, "mqtt_relay");
    }

    #[test]
    fn rejects_zero_timeout() {
        assert!(RelayConfig::from_toml("connect_timeout_secs = 0").is_err());
    }

    #[test]
    fn rejects_prefix_with_spaces() {
        assert!(RelayConfig::from_toml("command_prefix = \"/mq tt\"").is_err());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(RelayConfig::from_toml("command_prefix = ").is_err());
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = RelayConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, RelayConfig::default());
        assert!(path.exists());

        let reloaded = RelayConfig::load_or_create(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }
}
