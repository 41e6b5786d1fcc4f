//! Scripted in-memory transport
//! Serves canned payloads, counts calls and can inject delays, failures and link loss.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::debug;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::constants::LINK_EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{Advertisement, LinkEvent};
use crate::error::TransportError;

/// A write the mock accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub peripheral_id: String,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    advertisements: Vec<Advertisement>,
    services: Vec<Uuid>,
    /// Payloads served to every peripheral
    shared_payloads: HashMap<(Uuid, Uuid), Vec<u8>>,
    /// Payloads for one peripheral; these win over shared ones
    payloads: HashMap<(String, Uuid, Uuid), Vec<u8>>,
    connected: HashSet<String>,
    connect_error: Option<TransportError>,
    failing_reads: HashSet<Uuid>,
    connect_delay: Duration,
    read_delay: Duration,
    writes: Vec<WriteRecord>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    link_tx: broadcast::Sender<LinkEvent>,
    connect_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (link_tx, _) = broadcast::channel(LINK_EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MockState::default()),
            link_tx,
            connect_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_advertisement(self, id: &str, name: &str, rssi: i16) -> Self {
        self.lock().advertisements.push(Advertisement {
            id: id.to_string(),
            name: Some(name.to_string()),
            address: None,
            rssi: Some(rssi),
        });
        self
    }

    pub fn with_services(self, services: &[Uuid]) -> Self {
        self.lock().services = services.to_vec();
        self
    }

    pub fn with_payload(self, service: Uuid, characteristic: Uuid, payload: &[u8]) -> Self {
        self.set_payload(service, characteristic, payload);
        self
    }

    /// Serves `payload` only to `peripheral_id`. COR and MPPT reuse the same UUIDs.
    pub fn with_payload_for(
        self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Self {
        self.set_payload_for(peripheral_id, service, characteristic, payload);
        self
    }

    pub fn set_payload(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) {
        self.lock()
            .shared_payloads
            .insert((service, characteristic), payload.to_vec());
    }

    pub fn set_payload_for(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) {
        self.lock()
            .payloads
            .insert((peripheral_id.to_string(), service, characteristic), payload.to_vec());
    }

    pub fn fail_connect_with(&self, error: Option<TransportError>) {
        self.lock().connect_error = error;
    }

    pub fn fail_reads_of(&self, characteristic: Uuid) {
        self.lock().failing_reads.insert(characteristic);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self, peripheral_id: &str) {
        self.lock().connected.remove(peripheral_id);
        // Nobody listening is fine here.
        let _ = self.link_tx.send(LinkEvent::Disconnected {
            peripheral_id: peripheral_id.to_string(),
        });
    }

    pub fn is_connected(&self, peripheral_id: &str) -> bool {
        self.lock().connected.contains(peripheral_id)
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    fn ensure_connected(&self, peripheral_id: &str) -> Result<(), TransportError> {
        if self.lock().connected.contains(peripheral_id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected(peripheral_id.to_string()))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(
        &self,
        _service_filters: &[Uuid],
        _duration: Duration,
        _allow_duplicates: bool,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError> {
        let advertisements = self.lock().advertisements.clone();
        Ok(stream::iter(advertisements).boxed())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, error, known) = {
            let state = self.lock();
            let known = state.advertisements.iter().any(|a| a.id == peripheral_id);
            (state.connect_delay, state.connect_error.clone(), known)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(error);
        }
        if !known {
            return Err(TransportError::UnknownPeripheral(peripheral_id.to_string()));
        }
        debug!("Mock connected to {}", peripheral_id);
        self.lock().connected.insert(peripheral_id.to_string());
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), TransportError> {
        self.lock().connected.remove(peripheral_id);
        Ok(())
    }

    async fn retrieve_services(&self, peripheral_id: &str) -> Result<Vec<Uuid>, TransportError> {
        self.ensure_connected(peripheral_id)?;
        Ok(self.lock().services.clone())
    }

    async fn read(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.ensure_connected(peripheral_id)?;

        let state = self.lock();
        if state.failing_reads.contains(&characteristic) {
            return Err(TransportError::Backend(format!("read of {} failed", characteristic)));
        }
        state
            .payloads
            .get(&(peripheral_id.to_string(), service, characteristic))
            .or_else(|| state.shared_payloads.get(&(service, characteristic)))
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    async fn write(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_connected(peripheral_id)?;
        self.lock().writes.push(WriteRecord {
            peripheral_id: peripheral_id.to_string(),
            service,
            characteristic,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}
