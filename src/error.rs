//! Error types for the bridge core
//! Codec, registry, transport, storage and session failures are all typed here.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::ConnectionState;
use crate::core::registry::DeviceFamily;

/// Payload decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed payload: need {width} byte(s) at offset {offset}, buffer has {len}")]
    MalformedPayload {
        offset: usize,
        width: usize,
        len: usize,
    },
}

/// Characteristic registry misconfiguration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel not found: {family}/{channel}")]
    ChannelNotFound {
        family: DeviceFamily,
        channel: String,
    },
}

/// Failures reported by the BLE transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("peripheral not connected: {0}")]
    NotConnected(String),

    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

impl From<bluest::Error> for TransportError {
    fn from(e: bluest::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Known-peripheral store and telemetry sink failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by [`DeviceSession`](crate::core::bluetooth::DeviceSession) operations.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("already connecting or connected to {0}")]
    AlreadyConnecting(String),

    #[error("invalid transition from {from:?} on {event}")]
    InvalidTransition {
        from: ConnectionState,
        event: &'static str,
    },

    #[error("no active connection to {0}")]
    NotConnected(String),

    #[error("channel {channel} has no field named {field}")]
    UnknownField {
        channel: &'static str,
        field: String,
    },

    #[error("channel {0} is not writable")]
    NotWritable(&'static str),

    #[error("{operation} is not supported by {family} peripherals")]
    Unsupported {
        operation: &'static str,
        family: DeviceFamily,
    },
}

pub type ConnectError = SessionError;
pub type DisconnectError = SessionError;
pub type ReadError = SessionError;
pub type WriteError = SessionError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodecError::MalformedPayload {
            offset: 4,
            width: 2,
            len: 5,
        };
        assert_eq!(
            err.to_string(),
            "malformed payload: need 2 byte(s) at offset 4, buffer has 5"
        );

        let err = RegistryError::ChannelNotFound {
            family: DeviceFamily::Mppt,
            channel: "led".to_string(),
        };
        assert_eq!(err.to_string(), "channel not found: MPPT/led");

        let err = SessionError::from(TransportError::Timeout {
            operation: "read",
            after: Duration::from_secs(2),
        });
        assert_eq!(err.to_string(), "read timed out after 2s");

        let err = SessionError::Unsupported {
            operation: "reset",
            family: DeviceFamily::Cor,
        };
        assert_eq!(err.to_string(), "reset is not supported by COR peripherals");
    }
}
