pub mod bridge_config;
pub mod storage_config;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::bridge_config::BridgeConfig;
use crate::config::storage_config::StorageConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub bridge: BridgeConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Loads every section from `config_dir`; missing files fall back to defaults.
    pub async fn load(config_dir: &Path) -> Result<Self> {
        Ok(AppConfig {
            bridge: BridgeConfig::load_config(config_dir).await?,
            storage: StorageConfig::load_config(config_dir).await?,
        })
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.bridge.save_config(config_dir).await?;
        self.storage.save_config(config_dir).await
    }
}
