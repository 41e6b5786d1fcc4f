use crate::core::registry::DeviceFamily;
use crate::utils::ensure_directory_exists;
use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const CONFIG_FILE_NAME: &str = "storage_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding known peripherals and telemetry history.
    pub data_dir: PathBuf,

    /// Telemetry history file, one JSON record per line.
    pub telemetry_file: String,

    /// Owner telemetry records are attributed to; no records are kept without one.
    pub owner_id: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("data"),
            telemetry_file: "telemetry.jsonl".to_string(),
            owner_id: None,
        }
    }
}

impl StorageConfig {
    pub fn known_peripherals_path(&self, family: DeviceFamily) -> PathBuf {
        self.data_dir.join(format!("known_{}.json", family.as_str()))
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.data_dir.join(&self.telemetry_file)
    }

    /// Loads the config from `config_dir`, falling back to defaults.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize storage config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Storage config saved to {:?}.", file_path_str);
        Ok(())
    }
}
