//! COR Bridge library
//! BLE telemetry bridge for COR power hubs and MPPT solar charge controllers.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;
pub mod storage;
pub mod utils;
