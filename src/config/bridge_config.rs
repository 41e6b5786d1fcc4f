use crate::core::bluetooth::{
    ScanSettings, CONNECT_TIMEOUT_MS, CONTROL_MIRROR_INTERVAL_MS, COR_NAME_TOKENS,
    DEFAULT_ALLOW_DUPLICATES, DEFAULT_SCAN_DURATION_SECS, DEFAULT_TIME_TICK, MPPT_NAME_TOKENS,
    OPERATION_TIMEOUT_MS, PRIMARY_POLL_INTERVAL_MS, SERVICE_DISCOVERY_DELAY_MS,
    SLOW_POLL_INTERVAL_MS,
};
use crate::core::registry::{DeviceFamily, PollGroup};
use crate::utils::ensure_directory_exists;
use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

const CONFIG_FILE_NAME: &str = "bridge_config.json";

/// Name tokens that assign an advertised peripheral to a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameFilters {
    pub cor: Vec<String>,
    pub mppt: Vec<String>,
}

impl Default for NameFilters {
    fn default() -> Self {
        NameFilters {
            cor: COR_NAME_TOKENS.iter().map(|t| t.to_string()).collect(),
            mppt: MPPT_NAME_TOKENS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl NameFilters {
    pub fn tokens(&self, family: DeviceFamily) -> &[String] {
        match family {
            DeviceFamily::Cor => &self.cor,
            DeviceFamily::Mppt => &self.mppt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Length of one scan window.
    pub scan_duration_secs: u64,

    /// Report repeated advertisements from the same peripheral.
    pub allow_duplicates: bool,

    /// Ignore peripherals advertising below this RSSI.
    pub min_rssi: Option<i16>,

    pub connect_timeout_ms: u64,

    /// Timeout for each characteristic read or write.
    pub operation_timeout_ms: u64,

    /// Pause between connecting and retrieving services.
    pub service_discovery_delay_ms: u64,

    pub primary_interval_ms: u64,
    pub slow_interval_ms: u64,
    pub control_mirror_interval_ms: u64,

    /// Tick sent in write headers until the peripheral reports its own.
    pub default_time_tick: u16,

    pub name_filters: NameFilters,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            allow_duplicates: DEFAULT_ALLOW_DUPLICATES,
            min_rssi: None,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            operation_timeout_ms: OPERATION_TIMEOUT_MS,
            service_discovery_delay_ms: SERVICE_DISCOVERY_DELAY_MS,
            primary_interval_ms: PRIMARY_POLL_INTERVAL_MS,
            slow_interval_ms: SLOW_POLL_INTERVAL_MS,
            control_mirror_interval_ms: CONTROL_MIRROR_INTERVAL_MS,
            default_time_tick: DEFAULT_TIME_TICK,
            name_filters: NameFilters::default(),
        }
    }
}

impl BridgeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn service_discovery_delay(&self) -> Duration {
        Duration::from_millis(self.service_discovery_delay_ms)
    }

    /// Cadence of a poll group; `None` for groups that are never scheduled.
    pub fn poll_interval(&self, group: PollGroup) -> Option<Duration> {
        let millis = match group {
            PollGroup::Primary => self.primary_interval_ms,
            PollGroup::Slow => self.slow_interval_ms,
            PollGroup::ControlMirror => self.control_mirror_interval_ms,
            PollGroup::OnDemand => return None,
        };
        Some(Duration::from_millis(millis.max(1)))
    }

    pub fn scan_settings(&self, family: DeviceFamily) -> ScanSettings {
        ScanSettings {
            duration: Duration::from_secs(self.scan_duration_secs),
            allow_duplicates: self.allow_duplicates,
            min_rssi: self.min_rssi,
            name_tokens: self.name_filters.tokens(family).to_vec(),
        }
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
                error!("Failed to serialize bridge config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;

        info!("Bridge config saved to {:?}.", file_path_str);
        Ok(())
    }
}
