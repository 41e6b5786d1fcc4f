//! BLE transport abstraction
//! Sessions talk to peripherals only through this trait, so a real adapter and
//! a scripted mock are interchangeable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::types::{Advertisement, LinkEvent};
use crate::error::TransportError;

pub type SharedTransport = Arc<dyn Transport>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts a scan. The returned stream ends once `duration` has elapsed.
    async fn scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError>;

    async fn connect(&self, peripheral_id: &str) -> Result<(), TransportError>;

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), TransportError>;

    /// Discovers services and characteristics, returning the service ids found.
    async fn retrieve_services(&self, peripheral_id: &str) -> Result<Vec<Uuid>, TransportError>;

    async fn read(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribes to link events for every peripheral this transport manages.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}
