use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::connection::{ConnectionEvent, ConnectionStateMachine};
use crate::core::bluetooth::events::EventEmitter;
use crate::core::bluetooth::transport::SharedTransport;
use crate::core::bluetooth::types::{Advertisement, PeripheralDescriptor, SessionEvent};
use crate::core::registry::DeviceFamily;
use crate::error::TransportError;

/// How one scan window is run and filtered
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub duration: Duration,
    pub allow_duplicates: bool,
    /// Advertisements weaker than this are ignored
    pub min_rssi: Option<i16>,
    /// A peripheral belongs to the family when its name contains any token
    pub name_tokens: Vec<String>,
}

/// Everything the background scan task needs
struct ScanContext {
    family: DeviceFamily,
    settings: ScanSettings,
    discovered: Arc<Mutex<HashMap<String, PeripheralDescriptor>>>,
    machine: Arc<Mutex<ConnectionStateMachine>>,
    emitter: EventEmitter,
}

impl ScanContext {
    fn accept(&self, advertisement: &Advertisement) -> Option<PeripheralDescriptor> {
        let name = advertisement.name.as_deref()?;
        if !self.settings.name_tokens.iter().any(|token| name.contains(token.as_str())) {
            return None;
        }
        if let Some(floor) = self.settings.min_rssi {
            if advertisement.rssi.is_some_and(|rssi| rssi < floor) {
                debug!("Ignoring {} with weak signal {:?}", name, advertisement.rssi);
                return None;
            }
        }

        let descriptor = PeripheralDescriptor::from_advertisement(advertisement, self.family);
        info!(
            "Found {} device: ID: {}, Name: {}, Address: {:?}, RSSI: {:?}",
            self.family, descriptor.id, descriptor.display_name, descriptor.address, descriptor.rssi
        );
        self.discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(descriptor.id.clone(), descriptor.clone());
        Some(descriptor)
    }

    fn finish(&self) {
        let found = self.discovered.lock().unwrap_or_else(|e| e.into_inner()).len();
        {
            let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
            match machine.apply(ConnectionEvent::ScanFinished { found }) {
                Ok(_) => self.emitter.state_changed(self.family, &machine),
                Err(e) => debug!("Scan finished outside of Scanning: {}", e),
            }
        }
        self.emitter.emit(SessionEvent::ScanFinished {
            family: self.family,
            found,
        });
        info!("{} scan complete, {} peripheral(s) found", self.family, found);
    }
}

pub struct BluetoothScanner {
    family: DeviceFamily,
    transport: SharedTransport,
    discovered: Arc<Mutex<HashMap<String, PeripheralDescriptor>>>,
    machine: Arc<Mutex<ConnectionStateMachine>>,
    emitter: EventEmitter,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(
        family: DeviceFamily,
        transport: SharedTransport,
        machine: Arc<Mutex<ConnectionStateMachine>>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            family,
            transport,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            machine,
            emitter,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Peripherals found in the latest scan window.
    pub fn discovered(&self) -> Vec<PeripheralDescriptor> {
        self.discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn find(&self, peripheral_id: &str) -> Option<PeripheralDescriptor> {
        self.discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peripheral_id)
            .cloned()
    }

    /// Starts a scan window. The caller must already have moved the machine to Scanning.
    pub async fn start_scan(
        &mut self,
        settings: ScanSettings,
    ) -> Result<BoxStream<'static, PeripheralDescriptor>, TransportError> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }
        self.discovered.lock().unwrap_or_else(|e| e.into_inner()).clear();

        let advertisements = self
            .transport
            .scan(&[], settings.duration, settings.allow_duplicates)
            .await?;

        self.cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let context = ScanContext {
            family: self.family,
            settings,
            discovered: self.discovered.clone(),
            machine: self.machine.clone(),
            emitter: self.emitter.clone(),
        };
        let handle = tokio::spawn(Self::internal_scan_task(
            context,
            advertisements,
            self.cancel_token.clone(),
            tx,
        ));
        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|descriptor| (descriptor, rx))
        })
        .boxed())
    }

    async fn internal_scan_task(
        context: ScanContext,
        mut advertisements: BoxStream<'static, Advertisement>,
        cancel_token: CancellationToken,
        tx: mpsc::UnboundedSender<PeripheralDescriptor>,
    ) {
        let deadline = tokio::time::sleep(context.settings.duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Scan cancelled.");
                    break;
                }
                _ = &mut deadline => {
                    break;
                }
                next = advertisements.next() => {
                    match next {
                        Some(advertisement) => {
                            if let Some(descriptor) = context.accept(&advertisement) {
                                context.emitter.emit(SessionEvent::PeripheralDiscovered {
                                    peripheral: descriptor.clone(),
                                });
                                // The stream consumer may have gone away; keep recording.
                                let _ = tx.send(descriptor);
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
            }
        }

        context.finish();
    }

    pub async fn stop_scan(&mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Waiting for scan task to finish...");
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled successfully.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }
}
