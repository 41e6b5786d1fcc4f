//! Telemetry history sampling
//! One record per primary poll tick, written to a sink on behalf of the signed-in owner.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::core::registry::{self, DeviceFamily, FieldRef};
use crate::core::telemetry::TelemetryCache;
use crate::error::StorageError;
use crate::utils::ensure_directory_exists;

/// Local wall-clock format used for `created_at`
const CREATED_AT_FORMAT: &str = "%m/%d/%Y, %I:%M:%S %p";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: Uuid,
    pub family: DeviceFamily,
    pub owner_id: String,
    pub power: f64,
    pub temperature1: f64,
    pub temperature2: f64,
    pub voltage: f64,
    pub created_at: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, record: TelemetryRecord) -> Result<(), StorageError>;
}

/// Supplies the owner records are attributed to.
pub trait IdentityProvider: Send + Sync {
    fn owner_id(&self) -> Option<String>;
}

pub struct StaticIdentity {
    owner_id: Option<String>,
}

impl StaticIdentity {
    pub fn new(owner_id: Option<String>) -> Self {
        Self { owner_id }
    }
}

impl IdentityProvider for StaticIdentity {
    fn owner_id(&self) -> Option<String> {
        self.owner_id.clone()
    }
}

/// Appends one JSON object per line.
pub struct JsonLinesSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonLinesSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonLinesSink {
    async fn record(&self, record: TelemetryRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            ensure_directory_exists(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<TelemetryRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn record(&self, record: TelemetryRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

/// Builds records from the telemetry cache and hands them to a sink.
pub struct TelemetryRecorder {
    sink: Arc<dyn TelemetrySink>,
    identity: Arc<dyn IdentityProvider>,
}

impl TelemetryRecorder {
    pub fn new(sink: Arc<dyn TelemetrySink>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { sink, identity }
    }

    /// Writes one sample.
    ///
    /// Returns false without writing when nobody is signed in or when a recorded
    /// field has not been read from the peripheral yet.
    pub async fn record(
        &self,
        family: DeviceFamily,
        cache: &TelemetryCache,
    ) -> Result<bool, StorageError> {
        let Some(owner_id) = self.identity.owner_id() else {
            debug!("No owner signed in, skipping telemetry sample");
            return Ok(false);
        };

        let mapping = registry::profile(family).record;
        let value = |field: FieldRef| cache.value(field.channel, field.field);
        let (Some(power), Some(temperature1), Some(temperature2), Some(voltage)) = (
            value(mapping.power),
            value(mapping.temperature1),
            value(mapping.temperature2),
            value(mapping.voltage),
        ) else {
            debug!("{} sample incomplete, waiting for every recorded field", family);
            return Ok(false);
        };

        let now = Local::now();
        let record = TelemetryRecord {
            id: Uuid::new_v4(),
            family,
            owner_id,
            power,
            temperature1,
            temperature2,
            voltage,
            created_at: now.format(CREATED_AT_FORMAT).to_string(),
            timestamp: now.with_timezone(&Utc),
        };
        debug!("Recording {} telemetry sample {:?}", family, record);
        self.sink.record(record).await?;
        Ok(true)
    }
}
