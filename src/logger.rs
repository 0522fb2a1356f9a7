//! Logging facility
//!
//! Backend for the `log` facade, routing records to the host serial console.
//! Hypervisor diagnostics use `log::trace!` so that the hot exit path stays
//! silent unless explicitly enabled.

use log::{LevelFilter, Metadata, Record};

use crate::println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Initializes the global logger. Records above `max_level` are discarded.
pub fn init(max_level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max_level);
    }
}
