//! Core functionality for the COR bridge
//! Characteristic tables, payload codec, telemetry cache and the Bluetooth session layer.

pub mod bluetooth;
pub mod codec;
pub mod registry;
pub mod telemetry;

// Re-export commonly used types
pub use bluetooth::{DeviceSession, SessionEvent};
pub use registry::DeviceFamily;
pub use telemetry::{Reading, TelemetryCache};
