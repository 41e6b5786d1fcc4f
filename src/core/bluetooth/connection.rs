//! Connection lifecycle for one peripheral slot
//! The state machine validates every transition; the manager performs the
//! connect handshake against the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use uuid::Uuid;

use crate::core::bluetooth::link::Link;
use crate::core::bluetooth::transport::SharedTransport;
use crate::core::bluetooth::types::{ConnectionSession, ConnectionState};
use crate::error::{SessionError, TransportError};

/// Inputs that drive [`ConnectionStateMachine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ScanStarted,
    ScanFinished { found: usize },
    ConnectRequested { peripheral_id: String, session_id: u64 },
    ConnectSucceeded,
    ConnectFailed { reason: String },
    DisconnectRequested,
    DisconnectCompleted,
    DisconnectFailed { reason: String },
    LinkLost,
    Abandon,
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::ScanStarted => "ScanStarted",
            ConnectionEvent::ScanFinished { .. } => "ScanFinished",
            ConnectionEvent::ConnectRequested { .. } => "ConnectRequested",
            ConnectionEvent::ConnectSucceeded => "ConnectSucceeded",
            ConnectionEvent::ConnectFailed { .. } => "ConnectFailed",
            ConnectionEvent::DisconnectRequested => "DisconnectRequested",
            ConnectionEvent::DisconnectCompleted => "DisconnectCompleted",
            ConnectionEvent::DisconnectFailed { .. } => "DisconnectFailed",
            ConnectionEvent::LinkLost => "LinkLost",
            ConnectionEvent::Abandon => "Abandon",
        }
    }
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    peripheral_id: Option<String>,
    session_id: Option<u64>,
    last_error: Option<String>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            peripheral_id: None,
            session_id: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peripheral_id(&self) -> Option<&str> {
        self.peripheral_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Peripheral currently being connected to or connected, if any.
    pub fn busy_with(&self) -> Option<String> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                Some(self.peripheral_id.clone().unwrap_or_default())
            }
            _ => None,
        }
    }

    /// The current connect attempt, once one has been made.
    pub fn session(&self) -> Option<ConnectionSession> {
        let session_id = self.session_id?;
        let peripheral_id = self.peripheral_id.clone()?;
        Some(ConnectionSession {
            session_id,
            peripheral_id,
            state: self.state,
            last_error: self.last_error.clone(),
        })
    }

    /// Applies `event`, returning the new state or why the transition is not allowed.
    pub fn apply(&mut self, event: ConnectionEvent) -> Result<ConnectionState, SessionError> {
        use ConnectionState::*;

        let next = match (self.state, event) {
            (Idle | Discovered | Disconnected | Error, ConnectionEvent::ScanStarted) => Scanning,
            (Scanning, ConnectionEvent::ScanFinished { found }) => {
                if found > 0 {
                    Discovered
                } else {
                    Idle
                }
            }
            (Connecting | Connected, ConnectionEvent::ConnectRequested { .. }) => {
                return Err(SessionError::AlreadyConnecting(
                    self.peripheral_id.clone().unwrap_or_default(),
                ));
            }
            (
                Idle | Discovered | Disconnected | Error,
                ConnectionEvent::ConnectRequested {
                    peripheral_id,
                    session_id,
                },
            ) => {
                self.peripheral_id = Some(peripheral_id);
                self.session_id = Some(session_id);
                self.last_error = None;
                Connecting
            }
            (Connecting, ConnectionEvent::ConnectSucceeded) => Connected,
            (Connecting, ConnectionEvent::ConnectFailed { reason }) => {
                self.last_error = Some(reason);
                Error
            }
            (Connected, ConnectionEvent::DisconnectRequested) => Disconnecting,
            (Disconnecting, ConnectionEvent::DisconnectCompleted) => Disconnected,
            (Disconnecting, ConnectionEvent::DisconnectFailed { reason }) => {
                self.last_error = Some(reason);
                Error
            }
            (Connected, ConnectionEvent::LinkLost) => Disconnected,
            (Error, ConnectionEvent::Abandon) => Disconnected,
            (from, event) => {
                return Err(SessionError::InvalidTransition {
                    from,
                    event: event.name(),
                });
            }
        };

        self.state = next;
        Ok(next)
    }
}

/// Connection manager for one slot
#[derive(Clone)]
pub struct ConnectionManager {
    transport: SharedTransport,
    connect_timeout: Duration,
    operation_timeout: Duration,
    settle_delay: Duration,
}

impl ConnectionManager {
    pub fn new(
        transport: SharedTransport,
        connect_timeout: Duration,
        operation_timeout: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            transport,
            connect_timeout,
            operation_timeout,
            settle_delay,
        }
    }

    /// Connects, waits for the peripheral to settle and checks its services.
    ///
    /// The whole handshake shares one connect timeout. No retries are made.
    /// A link opened by a handshake that then fails is closed again.
    pub async fn try_connect(
        &self,
        peripheral_id: &str,
        required_services: &[Uuid],
    ) -> Result<Arc<Link>, TransportError> {
        info!("Initiating connection to {}...", peripheral_id);
        let opened = AtomicBool::new(false);
        let handshake = self.handshake(peripheral_id, required_services, &opened);
        let result = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                operation: "connect",
                after: self.connect_timeout,
            }),
        };
        if let Err(e) = result {
            if opened.load(Ordering::SeqCst) {
                self.drop_partial(peripheral_id).await;
            }
            return Err(e);
        }

        info!("Connection and setup process completed successfully");
        Ok(Arc::new(Link::new(
            self.transport.clone(),
            peripheral_id,
            self.operation_timeout,
        )))
    }

    async fn handshake(
        &self,
        peripheral_id: &str,
        required_services: &[Uuid],
        opened: &AtomicBool,
    ) -> Result<(), TransportError> {
        self.transport.connect(peripheral_id).await?;
        opened.store(true, Ordering::SeqCst);

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        info!("Connection successful, discovering services...");
        let services = self.transport.retrieve_services(peripheral_id).await?;
        if let Some(missing) = required_services.iter().find(|s| !services.contains(s)) {
            warn!("Required service {} not found on {}", missing, peripheral_id);
            return Err(TransportError::ServiceNotFound(*missing));
        }
        Ok(())
    }

    async fn drop_partial(&self, peripheral_id: &str) {
        if let Err(e) = self.disconnect(peripheral_id).await {
            warn!("Failed to drop partial connection to {}: {}", peripheral_id, e);
        }
    }

    pub async fn disconnect(&self, peripheral_id: &str) -> Result<(), TransportError> {
        info!("Disconnecting from device {}", peripheral_id);
        tokio::time::timeout(self.operation_timeout, self.transport.disconnect(peripheral_id))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "disconnect",
                after: self.operation_timeout,
            })?
    }
}
