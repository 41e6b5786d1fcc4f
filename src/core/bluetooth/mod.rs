//! Bluetooth functionality for the COR bridge
//! This module handles scanning, connecting, polling and control writes
//! for COR power hubs and MPPT solar controllers.

mod bluest_transport;
mod connection;
mod constants;
mod events;
mod link;
/// In-memory transport for tests and offline runs; left out of release builds
/// unless the `mock` feature is on.
#[cfg(any(test, debug_assertions, feature = "mock"))]
pub mod mock;
mod scanner;
mod scheduler;
mod session;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionStateMachine};
pub use constants::*; // Re-export all constants
pub use events::EventEmitter;
pub use link::Link;
pub use scanner::{BluetoothScanner, ScanSettings};
pub use scheduler::{PollContext, PollJob, PollScheduler};
pub use session::{DeviceSession, SessionOptions};
pub use transport::{SharedTransport, Transport};
pub use types::{
    Advertisement, ConnectionSession, ConnectionState, LinkEvent, PeripheralDescriptor,
    SessionEvent,
};
