//! Session event fan-out
//! Every state change, reading and control write is broadcast to subscribers.

use log::debug;
use tokio::sync::broadcast;

use crate::core::bluetooth::connection::ConnectionStateMachine;
use crate::core::bluetooth::types::SessionEvent;
use crate::core::registry::DeviceFamily;

#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("No subscribers for session event: {:?}", e.0);
        }
    }

    /// Publishes the machine's current state.
    pub fn state_changed(&self, family: DeviceFamily, machine: &ConnectionStateMachine) {
        self.emit(SessionEvent::StateChanged {
            family,
            peripheral_id: machine.peripheral_id().map(str::to_string),
            state: machine.state(),
            error: machine.last_error().map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let emitter = EventEmitter::new(8);
        emitter.emit(SessionEvent::ScanFinished {
            family: DeviceFamily::Cor,
            found: 0,
        });

        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();
        emitter.emit(SessionEvent::ScanFinished {
            family: DeviceFamily::Mppt,
            found: 1,
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                SessionEvent::ScanFinished { family, found } => {
                    assert_eq!(family, DeviceFamily::Mppt);
                    assert_eq!(found, 1);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
