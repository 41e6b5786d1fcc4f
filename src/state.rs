//! Application state management
//! One device session per family over a shared transport.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::config::AppConfig;
use crate::core::bluetooth::{BluestTransport, DeviceSession, SessionOptions, SharedTransport};
use crate::core::registry::DeviceFamily;
use crate::storage::{JsonFileStore, JsonLinesSink, StaticIdentity, TelemetryRecorder};

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    cor: DeviceSession,
    mppt: DeviceSession,
}

impl AppState {
    pub fn new(config: AppConfig, transport: SharedTransport) -> Self {
        let recorder = Arc::new(TelemetryRecorder::new(
            Arc::new(JsonLinesSink::new(config.storage.telemetry_path())),
            Arc::new(StaticIdentity::new(config.storage.owner_id.clone())),
        ));
        let build = |family: DeviceFamily| {
            DeviceSession::new(
                family,
                transport.clone(),
                config.bridge.clone(),
                SessionOptions {
                    store: Some(Arc::new(JsonFileStore::new(
                        config.storage.known_peripherals_path(family),
                    ))),
                    recorder: Some(recorder.clone()),
                },
            )
        };

        let cor = build(DeviceFamily::Cor);
        let mppt = build(DeviceFamily::Mppt);
        Self { config, cor, mppt }
    }

    /// Creates state backed by the system Bluetooth adapter.
    pub async fn with_bluetooth(config: AppConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let transport = BluestTransport::new().await?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn session(&self, family: DeviceFamily) -> &DeviceSession {
        match family {
            DeviceFamily::Cor => &self.cor,
            DeviceFamily::Mppt => &self.mppt,
        }
    }

    /// Seeds both sessions from their stores. Failures are logged, not fatal.
    pub async fn load_known_peripherals(&self) {
        for family in DeviceFamily::ALL {
            if let Err(e) = self.session(family).load_known_peripherals().await {
                warn!("Failed to load known {} peripherals: {}", family, e);
            }
        }
    }
}
