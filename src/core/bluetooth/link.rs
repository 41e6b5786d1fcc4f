//! A live connection to one peripheral
//! All reads and writes for a connection go through one Link, one at a time.

use std::fmt;
use std::time::Duration;

use log::debug;
use tokio::sync::Mutex;

use crate::core::bluetooth::transport::SharedTransport;
use crate::core::registry::ChannelDescriptor;
use crate::error::TransportError;

pub struct Link {
    transport: SharedTransport,
    peripheral_id: String,
    operation_timeout: Duration,
    /// Serialises characteristic traffic
    lock: Mutex<()>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("peripheral_id", &self.peripheral_id)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(
        transport: SharedTransport,
        peripheral_id: &str,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            peripheral_id: peripheral_id.to_string(),
            operation_timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn peripheral_id(&self) -> &str {
        &self.peripheral_id
    }

    pub async fn read(&self, channel: &ChannelDescriptor) -> Result<Vec<u8>, TransportError> {
        let _guard = self.lock.lock().await;
        let payload = tokio::time::timeout(
            self.operation_timeout,
            self.transport
                .read(&self.peripheral_id, channel.service, channel.characteristic),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "read",
            after: self.operation_timeout,
        })??;

        debug!("Read {} from {}: {:02X?}", channel.name, self.peripheral_id, payload);
        Ok(payload)
    }

    pub async fn write(
        &self,
        channel: &ChannelDescriptor,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let _guard = self.lock.lock().await;
        debug!("Writing {} to {}: {:02X?}", channel.name, self.peripheral_id, payload);
        tokio::time::timeout(
            self.operation_timeout,
            self.transport
                .write(&self.peripheral_id, channel.service, channel.characteristic, payload),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "write",
            after: self.operation_timeout,
        })?
    }
}
