//! Transport backed by the host Bluetooth adapter
//! Wraps bluest: scanning, connecting, characteristic discovery and link monitoring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::LINK_EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::transport::Transport;
use crate::core::bluetooth::types::{Advertisement, LinkEvent};
use crate::error::TransportError;

type CharacteristicKey = (String, Uuid, Uuid);

pub struct BluestTransport {
    adapter: Adapter,
    /// Map of peripheral ids to devices seen while scanning
    devices: Arc<Mutex<HashMap<String, Device>>>,
    characteristics: Mutex<HashMap<CharacteristicKey, Characteristic>>,
    link_tx: broadcast::Sender<LinkEvent>,
    watchers: Mutex<HashMap<String, CancellationToken>>,
}

impl BluestTransport {
    /// Opens the default adapter and waits until it is powered on.
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let (link_tx, _) = broadcast::channel(LINK_EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Mutex::new(HashMap::new()),
            link_tx,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    fn device(&self, peripheral_id: &str) -> Result<Device, TransportError> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(peripheral_id.to_string()))
    }

    fn characteristic(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, TransportError> {
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(peripheral_id.to_string(), service, characteristic))
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    async fn scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        service_filters: Vec<Uuid>,
        duration: Duration,
        tx: mpsc::Sender<Advertisement>,
    ) -> Result<(), bluest::Error> {
        // Peripherals still connected from an earlier run never advertise.
        info!("Checking for connected devices");
        for device in adapter.connected_devices().await? {
            let advertisement = Self::remember(&devices, device, None, None);
            if tx.send(advertisement).await.is_err() {
                return Ok(());
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&service_filters).await?;
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            debug!(
                                "Found device - Device: {:?}, RSSI: {:?}",
                                discovered_device.device, discovered_device.rssi
                            );
                            let advertisement = Self::remember(
                                &devices,
                                discovered_device.device,
                                discovered_device.adv_data.local_name,
                                discovered_device.rssi,
                            );
                            if tx.send(advertisement).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    info!("Scan window of {:?} elapsed.", duration);
                    break;
                }
            }
        }
        Ok(())
    }

    fn remember(
        devices: &Mutex<HashMap<String, Device>>,
        device: Device,
        local_name: Option<String>,
        rssi: Option<i16>,
    ) -> Advertisement {
        let id = device.id().to_string();
        let name = local_name.or_else(|| device.name().ok());
        let address = extract_mac_address(&id);
        devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), device);
        Advertisement { id, name, address, rssi }
    }

    fn watch_link(&self, peripheral_id: &str, device: Device) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peripheral_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let link_tx = self.link_tx.clone();
        let peripheral_id = peripheral_id.to_string();
        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch connection events for {}: {}", peripheral_id, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            info!("Peripheral {} disconnected", peripheral_id);
                            let event = LinkEvent::Disconnected {
                                peripheral_id: peripheral_id.clone(),
                            };
                            if let Err(e) = link_tx.send(event) {
                                debug!("No link event subscribers: {}", e);
                            }
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            }
        });
    }
}

/// Pulls a MAC address out of a platform device id, if it carries one.
fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

#[async_trait]
impl Transport for BluestTransport {
    async fn scan(
        &self,
        service_filters: &[Uuid],
        duration: Duration,
        allow_duplicates: bool,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError> {
        debug!("Scanning for {:?} (duplicates: {})", duration, allow_duplicates);
        let (tx, rx) = mpsc::channel(64);
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let service_filters = service_filters.to_vec();

        tokio::spawn(async move {
            if let Err(e) = Self::scan_task(adapter, devices, service_filters, duration, tx).await {
                error!("Bluetooth scan failed: {}", e);
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|advertisement| (advertisement, rx))
        })
        .boxed())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<(), TransportError> {
        let device = self.device(peripheral_id)?;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", peripheral_id);
            self.adapter.connect_device(&device).await?;
        }
        self.watch_link(peripheral_id, device);
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), TransportError> {
        if let Some(token) = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peripheral_id)
        {
            token.cancel();
        }
        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _, _), _| id != peripheral_id);

        let device = self.device(peripheral_id)?;
        if device.is_connected().await {
            info!("Disconnecting from device {}", peripheral_id);
            self.adapter.disconnect_device(&device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", peripheral_id);
        }
        Ok(())
    }

    async fn retrieve_services(&self, peripheral_id: &str) -> Result<Vec<Uuid>, TransportError> {
        let device = self.device(peripheral_id)?;
        let services = device.services().await?;

        let mut found = Vec::with_capacity(services.len());
        let mut discovered = Vec::new();
        for service in services {
            let service_uuid = service.uuid();
            info!("Available service: {}", service_uuid);
            for characteristic in service.characteristics().await? {
                let key = (peripheral_id.to_string(), service_uuid, characteristic.uuid());
                discovered.push((key, characteristic));
            }
            found.push(service_uuid);
        }

        self.characteristics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(discovered);
        Ok(found)
    }

    async fn read(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(peripheral_id, service, characteristic)?;
        Ok(characteristic.read().await?)
    }

    async fn write(
        &self,
        peripheral_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(peripheral_id, service, characteristic)?;
        characteristic.write(data).await?;
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}
