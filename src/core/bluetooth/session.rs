//! Device session for one connection slot
//! Ties scanning, the connection state machine, polling and control writes
//! together for a single peripheral family.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::bridge_config::BridgeConfig;
use crate::core::bluetooth::connection::{
    ConnectionEvent, ConnectionManager, ConnectionStateMachine,
};
use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::events::EventEmitter;
use crate::core::bluetooth::link::Link;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::scheduler::{PollContext, PollJob, PollScheduler};
use crate::core::bluetooth::transport::SharedTransport;
use crate::core::bluetooth::types::{
    ConnectionSession, ConnectionState, LinkEvent, PeripheralDescriptor, SessionEvent,
};
use crate::core::codec::{self, ControlValues};
use crate::core::registry::{self, ChannelDescriptor, DeviceFamily, PollGroup, WriteGuard};
use crate::core::telemetry::{Reading, TelemetryCache};
use crate::error::{ConnectError, DisconnectError, ReadError, SessionError, WriteError};
use crate::storage::{KnownPeripheralStore, KnownPeripherals, TelemetryRecorder};

/// Optional collaborators for a session
#[derive(Default)]
pub struct SessionOptions {
    pub store: Option<Arc<dyn KnownPeripheralStore>>,
    pub recorder: Option<Arc<TelemetryRecorder>>,
}

struct ActiveConnection {
    session_id: u64,
    peripheral_id: String,
    link: Arc<Link>,
    /// Cancelled when the connection ends, for whatever reason
    token: CancellationToken,
}

struct SessionInner {
    family: DeviceFamily,
    config: BridgeConfig,
    transport: SharedTransport,
    connection_manager: ConnectionManager,
    machine: Arc<Mutex<ConnectionStateMachine>>,
    scanner: tokio::sync::Mutex<BluetoothScanner>,
    /// Present exactly while the machine is Connected
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
    scheduler: tokio::sync::Mutex<PollScheduler>,
    emitter: EventEmitter,
    cache: Arc<TelemetryCache>,
    known: Mutex<KnownPeripherals>,
    store: Option<Arc<dyn KnownPeripheralStore>>,
    recorder: Option<Arc<TelemetryRecorder>>,
    next_session_id: AtomicU64,
}

/// Facade over one COR or MPPT slot. Cheap to clone.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    pub fn new(
        family: DeviceFamily,
        transport: SharedTransport,
        config: BridgeConfig,
        options: SessionOptions,
    ) -> Self {
        let machine = Arc::new(Mutex::new(ConnectionStateMachine::new()));
        let emitter = EventEmitter::new(EVENT_CHANNEL_CAPACITY);
        let scanner =
            BluetoothScanner::new(family, transport.clone(), machine.clone(), emitter.clone());
        let connection_manager = ConnectionManager::new(
            transport.clone(),
            config.connect_timeout(),
            config.operation_timeout(),
            config.service_discovery_delay(),
        );

        Self {
            inner: Arc::new(SessionInner {
                family,
                config,
                transport,
                connection_manager,
                machine,
                scanner: tokio::sync::Mutex::new(scanner),
                active: tokio::sync::Mutex::new(None),
                scheduler: tokio::sync::Mutex::new(PollScheduler::new()),
                emitter,
                cache: Arc::new(TelemetryCache::new(family)),
                known: Mutex::new(KnownPeripherals::new()),
                store: options.store,
                recorder: options.recorder,
                next_session_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn family(&self) -> DeviceFamily {
        self.inner.family
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_machine().state()
    }

    /// The latest connect attempt, if any.
    pub fn current_session(&self) -> Option<ConnectionSession> {
        self.inner.lock_machine().session()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.emitter.subscribe()
    }

    /// Last decoded value of a field.
    pub fn latest(&self, channel: &str, field: &str) -> Option<f64> {
        self.inner.cache.value(channel, field)
    }

    /// Starts a scan window, stopping any scan already running.
    ///
    /// The stream ends when the window closes. Discoveries are also broadcast
    /// as [`SessionEvent::PeripheralDiscovered`].
    pub async fn scan(&self) -> Result<BoxStream<'static, PeripheralDescriptor>, SessionError> {
        let inner = &self.inner;
        let mut scanner = inner.scanner.lock().await;
        scanner.stop_scan().await;

        inner.transition(ConnectionEvent::ScanStarted)?;
        match scanner.start_scan(inner.config.scan_settings(inner.family)).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                error!("Failed to start {} scan: {}", inner.family, e);
                if let Err(e) = inner.transition(ConnectionEvent::ScanFinished { found: 0 }) {
                    debug!("Could not close failed scan: {}", e);
                }
                Err(e.into())
            }
        }
    }

    pub async fn stop_scan(&self) {
        let mut scanner = self.inner.scanner.lock().await;
        if scanner.is_scanning() {
            info!("Stopping {} scan.", self.inner.family);
        }
        scanner.stop_scan().await;
    }

    /// Peripherals found in the latest scan window.
    pub async fn discovered(&self) -> Vec<PeripheralDescriptor> {
        self.inner.scanner.lock().await.discovered()
    }

    pub fn known_peripherals(&self) -> Vec<PeripheralDescriptor> {
        let mut peripherals: Vec<_> = self.inner.lock_known().values().cloned().collect();
        peripherals.sort_by(|a, b| a.id.cmp(&b.id));
        peripherals
    }

    /// Seeds the known-peripheral list from the store.
    pub async fn load_known_peripherals(&self) -> Result<Vec<PeripheralDescriptor>, SessionError> {
        if let Some(store) = &self.inner.store {
            let loaded = store.load().await?;
            info!("Loaded {} known {} peripheral(s)", loaded.len(), self.inner.family);
            self.inner.lock_known().extend(loaded);
        }
        Ok(self.known_peripherals())
    }

    pub async fn forget_peripheral(&self, peripheral_id: &str) -> Result<(), SessionError> {
        self.inner.lock_known().remove(peripheral_id);
        if let Some(store) = &self.inner.store {
            store.delete(peripheral_id).await?;
        }
        info!("Forgot peripheral {}", peripheral_id);
        Ok(())
    }

    /// Connects to a peripheral and starts polling it.
    ///
    /// A running scan is stopped first. Fails with `AlreadyConnecting` while
    /// another attempt is in progress or a peripheral is connected.
    pub async fn connect(&self, peripheral_id: &str) -> Result<ConnectionSession, ConnectError> {
        let inner = &self.inner;
        if let Some(current) = inner.lock_machine().busy_with() {
            return Err(SessionError::AlreadyConnecting(current));
        }
        self.stop_scan().await;

        let session_id = inner.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        inner.transition(ConnectionEvent::ConnectRequested {
            peripheral_id: peripheral_id.to_string(),
            session_id,
        })?;
        info!(
            "Connecting to {} peripheral {} (session {})",
            inner.family, peripheral_id, session_id
        );

        let link_events = inner.transport.link_events();
        let required_services = registry::required_services(inner.family);
        let link = match inner
            .connection_manager
            .try_connect(peripheral_id, &required_services)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to connect to {}: {}", peripheral_id, e);
                inner.transition(ConnectionEvent::ConnectFailed { reason: e.to_string() })?;
                return Err(e.into());
            }
        };

        {
            let mut active = inner.active.lock().await;
            inner.cache.clear();
            inner.transition(ConnectionEvent::ConnectSucceeded)?;

            let token = CancellationToken::new();
            spawn_link_watch(
                Arc::downgrade(&self.inner),
                session_id,
                peripheral_id.to_string(),
                link_events,
                token.clone(),
            );
            inner.scheduler.lock().await.start(
                session_id,
                inner.poll_jobs(),
                PollContext {
                    family: inner.family,
                    link: link.clone(),
                    cache: inner.cache.clone(),
                    emitter: inner.emitter.clone(),
                    recorder: inner.recorder.clone(),
                },
            );
            *active = Some(ActiveConnection {
                session_id,
                peripheral_id: peripheral_id.to_string(),
                link,
                token,
            });
        }

        inner.remember(peripheral_id).await;
        info!("{} peripheral {} connected", inner.family, peripheral_id);
        Ok(ConnectionSession {
            session_id,
            peripheral_id: peripheral_id.to_string(),
            state: ConnectionState::Connected,
            last_error: None,
        })
    }

    /// Stops polling and closes the connection. No readings are published
    /// once this returns.
    pub async fn disconnect(&self, peripheral_id: &str) -> Result<(), DisconnectError> {
        let inner = &self.inner;
        let active = {
            let mut active = inner.active.lock().await;
            match active.as_ref() {
                Some(current) if current.peripheral_id == peripheral_id => {}
                _ => return Err(SessionError::NotConnected(peripheral_id.to_string())),
            }
            inner.transition(ConnectionEvent::DisconnectRequested)?;
            active.take()
        };
        let Some(active) = active else {
            return Err(SessionError::NotConnected(peripheral_id.to_string()));
        };

        active.token.cancel();
        inner.scheduler.lock().await.cancel(active.session_id).await;

        match inner.connection_manager.disconnect(peripheral_id).await {
            Ok(()) => {
                inner.transition(ConnectionEvent::DisconnectCompleted)?;
                info!("{} peripheral {} disconnected", inner.family, peripheral_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", peripheral_id, e);
                inner.transition(ConnectionEvent::DisconnectFailed { reason: e.to_string() })?;
                Err(e.into())
            }
        }
    }

    /// Gives up on a failed attempt: Error becomes Disconnected.
    pub fn abandon(&self) -> Result<(), SessionError> {
        self.inner.transition(ConnectionEvent::Abandon).map(|_| ())
    }

    /// Reads every readable channel once, outside the poll cadence.
    ///
    /// Fails with `NotConnected` if the connection ends part way; nothing
    /// read after that point is published.
    pub async fn read_all(&self) -> Result<Vec<Reading>, ReadError> {
        let inner = &self.inner;
        let (session_id, link, token) = inner.current_connection().await?;

        let mut readings = Vec::new();
        for channel in registry::readable_channels(inner.family) {
            let payload = tokio::select! {
                _ = token.cancelled() => return Err(inner.not_connected()),
                result = link.read(channel) => result?,
            };

            let active = inner.active.lock().await;
            if !active.as_ref().is_some_and(|current| current.session_id == session_id) {
                debug!("Discarding {} read from ended session {}", channel.name, session_id);
                return Err(inner.not_connected());
            }
            let reading = inner.cache.ingest(channel, &payload)?;
            inner.emitter.emit(SessionEvent::Reading {
                reading: reading.clone(),
            });
            drop(active);
            readings.push(reading);
        }
        Ok(readings)
    }

    /// Writes control values to a channel.
    ///
    /// Fields not given are taken from the control mirror. Guarded channels
    /// are skipped (not an error) while the system is switched off.
    pub async fn write_control(
        &self,
        channel_name: &str,
        values: &ControlValues,
    ) -> Result<(), WriteError> {
        let inner = &self.inner;
        let channel = registry::lookup(inner.family, channel_name)?;
        if !channel.direction.is_writable() {
            return Err(SessionError::NotWritable(channel.name));
        }
        if let Some(field) = values.keys().find(|name| channel.field(name).is_none()) {
            return Err(SessionError::UnknownField {
                channel: channel.name,
                field: field.clone(),
            });
        }
        let link = inner.current_link().await?;

        if let Some(guard) = channel.guard {
            if !inner.guard_allows(channel, guard, values) {
                info!(
                    "Skipping {} write while {}.{} is off",
                    channel.name, guard.channel, guard.field
                );
                inner.emitter.emit(SessionEvent::WriteSkipped {
                    family: inner.family,
                    channel: channel.name,
                    reason: format!("{}.{} is off", guard.channel, guard.field),
                });
                return Ok(());
            }
        }

        let mut merged = inner.cache.control_values(channel);
        merged.extend(values.iter().map(|(name, value)| (name.clone(), *value)));
        let tick = inner.cache.tick().unwrap_or(inner.config.default_time_tick);
        let payload = codec::encode(&merged, channel, tick);

        link.write(channel, &payload).await?;
        if channel.direction.is_readable() {
            inner.cache.merge_control(channel, &merged);
        }
        info!("Wrote {} control {:?}", channel.name, merged);
        inner.emitter.emit(SessionEvent::ControlWritten {
            family: inner.family,
            channel: channel.name,
            payload,
        });
        Ok(())
    }

    /// Sends the controller reset command.
    pub async fn reset(&self) -> Result<(), WriteError> {
        if self.inner.family != DeviceFamily::Mppt {
            return Err(SessionError::Unsupported {
                operation: "reset",
                family: self.inner.family,
            });
        }
        let values: ControlValues = [("command".to_string(), 1), ("argument".to_string(), 2)]
            .into_iter()
            .collect();
        self.write_control("reset", &values).await
    }
}

impl SessionInner {
    fn lock_machine(&self) -> MutexGuard<'_, ConnectionStateMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_known(&self) -> MutexGuard<'_, KnownPeripherals> {
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, event: ConnectionEvent) -> Result<ConnectionState, SessionError> {
        let mut machine = self.lock_machine();
        let state = machine.apply(event)?;
        debug!("{} slot is now {}", self.family, state);
        self.emitter.state_changed(self.family, &machine);
        Ok(state)
    }

    fn not_connected(&self) -> SessionError {
        SessionError::NotConnected(self.family.to_string())
    }

    async fn current_link(&self) -> Result<Arc<Link>, SessionError> {
        self.current_connection().await.map(|(_, link, _)| link)
    }

    async fn current_connection(
        &self,
    ) -> Result<(u64, Arc<Link>, CancellationToken), SessionError> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| (active.session_id, active.link.clone(), active.token.clone()))
            .ok_or_else(|| self.not_connected())
    }

    fn poll_jobs(&self) -> Vec<PollJob> {
        [PollGroup::Primary, PollGroup::Slow, PollGroup::ControlMirror]
            .into_iter()
            .filter_map(|group| {
                Some(PollJob {
                    group,
                    interval: self.config.poll_interval(group)?,
                    channels: registry::channels_in(self.family, group).collect(),
                })
            })
            .collect()
    }

    /// A write that switches the guard flag on is always allowed.
    fn guard_allows(
        &self,
        channel: &ChannelDescriptor,
        guard: WriteGuard,
        values: &ControlValues,
    ) -> bool {
        if guard.channel == channel.name {
            if let Some(value) = values.get(guard.field) {
                if *value != 0 {
                    return true;
                }
            }
        }
        self.cache
            .value(guard.channel, guard.field)
            .is_some_and(|value| value != 0.0)
    }

    /// Adds or refreshes the peripheral in the known list and persists it.
    async fn remember(&self, peripheral_id: &str) {
        let scanned = self.scanner.lock().await.find(peripheral_id);
        let snapshot = {
            let mut known = self.lock_known();
            let mut descriptor = scanned
                .or_else(|| known.get(peripheral_id).cloned())
                .unwrap_or_else(|| PeripheralDescriptor {
                    id: peripheral_id.to_string(),
                    display_name: peripheral_id.to_string(),
                    rssi: None,
                    last_seen_at: Utc::now(),
                    family: self.family,
                    address: None,
                });
            descriptor.last_seen_at = Utc::now();
            known.insert(peripheral_id.to_string(), descriptor);
            known.clone()
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&snapshot).await {
                warn!("Failed to save known peripherals: {}", e);
            }
        }
    }

    async fn on_link_lost(&self, session_id: u64) {
        let active = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(current) if current.session_id == session_id => active.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            return;
        };

        warn!("Link to {} lost unexpectedly", active.peripheral_id);
        active.token.cancel();
        self.scheduler.lock().await.cancel(session_id).await;
        if let Err(e) = self.transition(ConnectionEvent::LinkLost) {
            warn!("Unexpected state on link loss: {}", e);
        }
        self.emitter.emit(SessionEvent::LinkLost {
            family: self.family,
            peripheral_id: active.peripheral_id,
        });
    }
}

fn spawn_link_watch(
    session: Weak<SessionInner>,
    session_id: u64,
    peripheral_id: String,
    mut events: broadcast::Receiver<LinkEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(LinkEvent::Disconnected { peripheral_id: lost }) if lost == peripheral_id => {
                    if let Some(inner) = session.upgrade() {
                        inner.on_link_lost(session_id).await;
                    }
                    break;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Link watcher for {} skipped {} event(s)", peripheral_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Link watcher for {} stopped", peripheral_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::bluetooth::mock::MockTransport;
    use crate::core::registry::{
        COR_CONTROLS_SERVICE, COR_CURRENT_CHAR, COR_LCD_CHAR, COR_LED_CHAR, COR_POWER_VOLTAGE_CHAR,
        COR_SERVICE, COR_SOC_CHAR, COR_TEMPERATURE_CHAR,
    };
    use crate::error::TransportError;

    const COR_ID: &str = "cor-1";

    fn cor_transport(system_byte: u8) -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .with_advertisement(COR_ID, "COR2 Hub", -50)
                .with_services(&[COR_SERVICE, COR_CONTROLS_SERVICE])
                .with_payload(
                    COR_SERVICE,
                    COR_SOC_CHAR,
                    &[0x00, 0x10, 0, 0x32, 0, 0x64, 0, 0, 0, 0],
                )
                .with_payload(
                    COR_SERVICE,
                    COR_POWER_VOLTAGE_CHAR,
                    &[0x00, 0x10, 0x04, 0xB0, 0x00, 0x64],
                )
                .with_payload(
                    COR_SERVICE,
                    COR_TEMPERATURE_CHAR,
                    &[0x00, 0x10, 20, 31, 0, 0, 0, 0, 0, 0],
                )
                .with_payload(COR_CONTROLS_SERVICE, COR_LED_CHAR, &[0x00, 0x10, 80])
                .with_payload(COR_CONTROLS_SERVICE, COR_LCD_CHAR, &[0x00, 0x10, 40])
                .with_payload(COR_CONTROLS_SERVICE, COR_CURRENT_CHAR, &[0x00, 0x10, system_byte]),
        )
    }

    fn session(transport: Arc<MockTransport>) -> DeviceSession {
        DeviceSession::new(
            DeviceFamily::Cor,
            transport,
            BridgeConfig::default(),
            SessionOptions::default(),
        )
    }

    /// Lets the first poll ticks run; later ticks are seconds away.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn values(pairs: &[(&str, i64)]) -> ControlValues {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_write_is_skipped_while_system_off() {
        let transport = cor_transport(0x00);
        let session = session(transport.clone());
        session.connect(COR_ID).await.unwrap();
        settle().await;
        session.read_all().await.unwrap();
        let mut events = session.subscribe();

        session.write_control("led", &values(&[("brightness", 50)])).await.unwrap();
        assert!(transport.writes().is_empty());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::WriteSkipped { channel: "led", .. }
        ));

        // Switching the system on is itself allowed.
        session
            .write_control("current", &values(&[("system_on", 1), ("ac_on", 1)]))
            .await
            .unwrap();
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data, vec![0x00, 0x10, 0x03]);

        session.write_control("led", &values(&[("brightness", 50)])).await.unwrap();
        assert_eq!(transport.writes()[1].data, vec![0x00, 0x10, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_write_fills_from_mirror() {
        let transport = cor_transport(0x05);
        let session = session(transport.clone());
        session.connect(COR_ID).await.unwrap();
        settle().await;
        session.read_all().await.unwrap();

        session.write_control("current", &values(&[("ac_on", 1)])).await.unwrap();
        assert_eq!(transport.writes()[0].data, vec![0x00, 0x10, 0x07]);
        assert_eq!(session.latest("current", "ac_on"), Some(1.0));

        // Turning the system off is not blocked by the guard.
        session.write_control("current", &values(&[("system_on", 0)])).await.unwrap();
        assert_eq!(transport.writes()[1].data, vec![0x00, 0x10, 0x06]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_uses_default_tick_before_any_read() {
        let transport = Arc::new(
            MockTransport::new()
                .with_advertisement(COR_ID, "COR2 Hub", -50)
                .with_services(&[COR_SERVICE, COR_CONTROLS_SERVICE]),
        );
        let session = session(transport.clone());
        session.connect(COR_ID).await.unwrap();
        settle().await;
        assert_eq!(session.latest("soc", "soc"), None);

        session
            .write_control("current", &values(&[("system_on", 1), ("ac_on", 1), ("dc_on", 0)]))
            .await
            .unwrap();
        assert_eq!(transport.writes()[0].data, vec![0x04, 0xD2, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_validation() {
        let transport = cor_transport(0x01);
        let session = session(transport.clone());

        assert!(matches!(
            session.write_control("led", &values(&[("brightness", 1)])).await,
            Err(SessionError::NotConnected(_))
        ));
        session.connect(COR_ID).await.unwrap();

        assert!(matches!(
            session.write_control("led", &values(&[("colour", 1)])).await,
            Err(SessionError::UnknownField { channel: "led", .. })
        ));
        assert!(matches!(
            session.write_control("soc", &values(&[])).await,
            Err(SessionError::NotWritable("soc"))
        ));
        assert!(matches!(
            session.write_control("on_off", &values(&[])).await,
            Err(SessionError::Registry(_))
        ));
        assert!(matches!(
            session.reset().await,
            Err(SessionError::Unsupported { operation: "reset", .. })
        ));
        assert!(transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_all_covers_every_readable_channel() {
        let transport = cor_transport(0x01);
        let session = session(transport.clone());
        assert!(matches!(session.read_all().await, Err(SessionError::NotConnected(_))));

        session.connect(COR_ID).await.unwrap();
        let readings = session.read_all().await.unwrap();
        let channels: Vec<_> = readings.iter().map(|r| r.channel).collect();
        assert_eq!(channels, vec!["soc", "power_voltage", "temperature", "led", "lcd", "current"]);
        assert_eq!(readings[0].get("soc"), Some(50.0));
        assert_eq!(readings[1].get("power"), Some(100.0));

        transport.fail_reads_of(COR_TEMPERATURE_CHAR);
        assert!(matches!(
            session.read_all().await,
            Err(SessionError::Transport(TransportError::Backend(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_read_all() {
        let transport = cor_transport(0x01);
        let session = session(transport.clone());
        session.connect(COR_ID).await.unwrap();
        transport.set_read_delay(Duration::from_secs(1));

        let reader = session.clone();
        let read = tokio::spawn(async move { reader.read_all().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut events = session.subscribe();
        session.disconnect(COR_ID).await.unwrap();
        assert!(matches!(read.await.unwrap(), Err(SessionError::NotConnected(_))));

        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Reading { .. }), "reading after disconnect");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_then_retry() {
        let transport = cor_transport(0x01);
        transport.fail_connect_with(Some(TransportError::Backend("radio busy".to_string())));
        let session = session(transport.clone());

        let err = session.connect(COR_ID).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Backend(_))));
        assert_eq!(session.state(), ConnectionState::Error);
        assert_eq!(
            session.current_session().unwrap().last_error.as_deref(),
            Some("bluetooth backend error: radio busy")
        );

        transport.fail_connect_with(None);
        let connected = session.connect(COR_ID).await.unwrap();
        assert_eq!(connected.session_id, 2);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_after_failure() {
        let transport = cor_transport(0x01);
        transport.fail_connect_with(Some(TransportError::Backend("radio busy".to_string())));
        let session = session(transport);

        assert!(session.abandon().is_err());
        session.connect(COR_ID).await.unwrap_err();
        session.abandon().unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_requires_matching_peripheral() {
        let transport = cor_transport(0x01);
        let session = session(transport.clone());
        session.connect(COR_ID).await.unwrap();

        assert!(matches!(
            session.disconnect("cor-2").await,
            Err(SessionError::NotConnected(_))
        ));
        session.disconnect(COR_ID).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!transport.is_connected(COR_ID));
        assert!(session.disconnect(COR_ID).await.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
