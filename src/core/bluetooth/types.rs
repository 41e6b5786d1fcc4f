//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::registry::DeviceFamily;
use crate::core::telemetry::Reading;

/// Raw advertisement as reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Platform-specific unique identifier for the peripheral
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// MAC address when the platform exposes one in the id
    pub address: Option<String>,
    pub rssi: Option<i16>,
}

/// A peripheral seen during a scan or remembered from an earlier connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    pub id: String,
    pub display_name: String,
    pub rssi: Option<i16>,
    pub last_seen_at: DateTime<Utc>,
    pub family: DeviceFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl PeripheralDescriptor {
    pub fn from_advertisement(advertisement: &Advertisement, family: DeviceFamily) -> Self {
        Self {
            id: advertisement.id.clone(),
            display_name: advertisement
                .name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            rssi: advertisement.rssi,
            last_seen_at: Utc::now(),
            family,
            address: advertisement.address.clone(),
        }
    }
}

/// Lifecycle of one connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of the current connect attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSession {
    pub session_id: u64,
    pub peripheral_id: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

/// Transport-level link notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Disconnected { peripheral_id: String },
}

/// Everything a session reports to its subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        family: DeviceFamily,
        peripheral_id: Option<String>,
        state: ConnectionState,
        error: Option<String>,
    },
    PeripheralDiscovered {
        peripheral: PeripheralDescriptor,
    },
    ScanFinished {
        family: DeviceFamily,
        found: usize,
    },
    Reading {
        reading: Reading,
    },
    PollFailed {
        family: DeviceFamily,
        channel: &'static str,
        error: String,
    },
    LinkLost {
        family: DeviceFamily,
        peripheral_id: String,
    },
    ControlWritten {
        family: DeviceFamily,
        channel: &'static str,
        payload: Vec<u8>,
    },
    WriteSkipped {
        family: DeviceFamily,
        channel: &'static str,
        reason: String,
    },
}
