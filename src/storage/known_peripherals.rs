//! Known-peripheral persistence
//! Peripherals are remembered on successful connect and forgotten only on request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::PeripheralDescriptor;
use crate::error::StorageError;
use crate::utils::ensure_directory_exists;

pub type KnownPeripherals = HashMap<String, PeripheralDescriptor>;

#[async_trait]
pub trait KnownPeripheralStore: Send + Sync {
    async fn save(&self, peripherals: &KnownPeripherals) -> Result<(), StorageError>;
    async fn load(&self) -> Result<KnownPeripherals, StorageError>;
    async fn delete(&self, peripheral_id: &str) -> Result<(), StorageError>;
}

/// On-disk layout: one JSON object holding the list under a single key
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPeripherals {
    #[serde(rename = "knownPeripherals", default)]
    known_peripherals: Vec<PeripheralDescriptor>,
}

/// Keeps known peripherals in a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<KnownPeripherals, StorageError> {
        if !self.path.exists() {
            warn!("Known peripherals file not found at {:?}, starting empty.", self.path);
            return Ok(KnownPeripherals::new());
        }
        let json = fs::read_to_string(&self.path).await?;
        let stored: StoredPeripherals = serde_json::from_str(&json)?;
        Ok(stored
            .known_peripherals
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect())
    }

    async fn write_file(&self, peripherals: &KnownPeripherals) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            ensure_directory_exists(parent).await?;
        }
        let mut known_peripherals: Vec<_> = peripherals.values().cloned().collect();
        known_peripherals.sort_by(|a, b| a.id.cmp(&b.id));

        let json = serde_json::to_string_pretty(&StoredPeripherals { known_peripherals })?;
        fs::write(&self.path, json).await?;
        info!("Saved {} known peripheral(s) to {:?}", peripherals.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl KnownPeripheralStore for JsonFileStore {
    async fn save(&self, peripherals: &KnownPeripherals) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        self.write_file(peripherals).await
    }

    async fn load(&self) -> Result<KnownPeripherals, StorageError> {
        let _guard = self.lock.lock().await;
        self.read_file().await
    }

    async fn delete(&self, peripheral_id: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut peripherals = self.read_file().await?;
        if peripherals.remove(peripheral_id).is_some() {
            self.write_file(&peripherals).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    peripherals: Mutex<KnownPeripherals>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> KnownPeripherals {
        self.peripherals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl KnownPeripheralStore for MemoryStore {
    async fn save(&self, peripherals: &KnownPeripherals) -> Result<(), StorageError> {
        *self.peripherals.lock().unwrap_or_else(|e| e.into_inner()) = peripherals.clone();
        Ok(())
    }

    async fn load(&self) -> Result<KnownPeripherals, StorageError> {
        Ok(self.snapshot())
    }

    async fn delete(&self, peripheral_id: &str) -> Result<(), StorageError> {
        self.peripherals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peripheral_id);
        Ok(())
    }
}
