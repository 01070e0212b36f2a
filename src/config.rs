use crate::mqtt::MqttConfig;
use crate::persistence::SavedCommand;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const APP_DIR: &str = "mqtt-commander";
const CONFIG_FILE: &str = "config.toml";
const MESSAGES_FILE: &str = "messages.jsonl";
pub const CONFIG_ENV: &str = "MQTT_COMMANDER_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    pub commands: Vec<SavedCommand>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Message log location, defaults to the user's data directory
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn message_log_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => {
                let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(APP_DIR);
                path.push(MESSAGES_FILE);
                path
            }
        }
    }
}

impl AppConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Loads `path`, writing a default config there first if it does not exist.
    pub async fn ensure_default_config(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;
        if !exists {
            warn!(
                "No config file at {}, writing defaults",
                path.display()
            );
            Self::default().save(path).await?;
        }
        Self::load(path).await
    }

    /// Config path from the first CLI argument, then the environment, then the
    /// user's config directory.
    pub fn resolve_path(cli_arg: Option<String>) -> PathBuf {
        if let Some(path) = cli_arg {
            return PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(APP_DIR);
        path.push(CONFIG_FILE);
        info!("Using default config location {}", path.display());
        path
    }
}
