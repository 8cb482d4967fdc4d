//! A basic logger implementation for system-wide logging in the runtime.
//!
//! This enables every crate to use the `log` crate's macros anywhere.
//! Log statements are written to the host's standard error, one line per
//! record, prefixed by the core that emitted them.

use core::sync::atomic::{AtomicBool, Ordering};
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use std::io::Write;

#[cfg(test)]
mod test;

/// Serializes whole lines so records from different cores never interleave.
pub struct Logger {
    lock: Mutex<()>,
}

static LOGGER: Logger = Logger { lock: Mutex::new(()) };
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl Logger {
    fn format(record: &Record) -> String {
        match cpu::try_current_cpu() {
            Some(cpu) => format!("[{:?}] {} - {}", cpu, record.level(), record.args()),
            None => format!("[host] {} - {}", record.level(), record.args()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Logger::format(record);
        let _guard = self.lock.lock();
        // there is nowhere else to report a failed write to stderr
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs the logger as the `log` crate's backend and sets the maximum level.
///
/// Installing twice only updates the level, so several runtimes booted in one
/// process share the backend.
pub fn init(level: LevelFilter) -> Result<(), &'static str> {
    if !INSTALLED.swap(true, Ordering::AcqRel) && log::set_logger(&LOGGER).is_err() {
        INSTALLED.store(false, Ordering::Release);
        return Err("logger::init(): a different logger is already installed");
    }
    set_level(level);
    Ok(())
}

/// Changes the maximum level of records that are emitted.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
