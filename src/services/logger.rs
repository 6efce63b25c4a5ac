// Relay Logger
// log facade backend: timestamped stderr lines, mirrored onto the bus

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::Arc;

use crate::services::{redact_text, TelemetryBus};

/// Writes every record to stderr and forwards it to the Telemetry Bus as a
/// `log` envelope so WebSocket observers see the same stream.
pub struct RelayLogger {
    level: LevelFilter,
    bus: Arc<TelemetryBus>,
}

impl RelayLogger {
    /// Install as the global logger. `debug` widens the level filter.
    pub fn init(bus: Arc<TelemetryBus>, debug: bool) -> Result<(), log::SetLoggerError> {
        let level = if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        let logger = Box::new(RelayLogger { level, bus });
        log::set_boxed_logger(logger)?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for RelayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = chrono::Local::now();
        let message = redact_text(&format!("{}", record.args()));
        eprintln!(
            "[{}][{}][{}][{}] {}",
            timestamp.format("%Y-%m-%d"),
            timestamp.format("%H:%M:%S"),
            record.target(),
            record.level(),
            message
        );

        let level = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        self.bus
            .publish_log(level, &message, Some(record.target()), None);
    }

    fn flush(&self) {}
}
