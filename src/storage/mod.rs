//! Persistence collaborators
//! Known peripherals and telemetry history, each behind a small async trait.

mod known_peripherals;
mod telemetry_sink;

pub use known_peripherals::{JsonFileStore, KnownPeripheralStore, KnownPeripherals, MemoryStore};
pub use telemetry_sink::{
    IdentityProvider, JsonLinesSink, MemorySink, StaticIdentity, TelemetryRecord, TelemetryRecorder,
    TelemetrySink,
};
