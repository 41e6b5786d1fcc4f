//! Log forwarding
//! Echoes records to stderr and forwards them to subscribers as `LogMessage`s.

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::sync::OnceLock;
use tokio::sync::broadcast;

const LOG_CHANNEL_CAPACITY: usize = 512;

static LOGGER: OnceLock<BridgeLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

pub struct BridgeLogger {
    sender: broadcast::Sender<LogMessage>,
    level: Level,
}

impl BridgeLogger {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { sender, level }
    }

    /// Installs the global logger. Use [`subscribe`] to receive forwarded messages.
    ///
    /// Fails if another logger is already installed; callers fall back to env_logger.
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| BridgeLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(logger.level.to_level_filter()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.sender.subscribe()
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        // Nobody listening is fine; stderr already has the line.
        let _ = self.sender.send(log_message);
    }
}

/// Receiver for messages of the installed bridge logger, if any.
pub fn subscribe() -> Option<broadcast::Receiver<LogMessage>> {
    LOGGER.get().map(BridgeLogger::subscribe)
}

impl log::Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}
