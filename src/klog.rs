//! Kernel logger behind the `log` facade.
//!
//! The platform hands us a sink (normally the console driver's formatted
//! writer). Records below the configured level are dropped before formatting.

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Once;

pub type Sink = fn(fmt::Arguments<'_>);

struct KernelLogger {
    sink: Once<Sink>,
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = match self.sink.get() {
            Some(sink) => sink,
            None => return,
        };

        let display_level = match record.level() {
            Level::Error => "ERR",
            Level::Warn => "WRN",
            Level::Info => "INF",
            Level::Debug => "DBG",
            Level::Trace => "TRC",
        };
        sink(format_args!("[{}] {}\n", display_level, record.args()));
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger { sink: Once::new() };

/// Installs the kernel logger. Only the first sink wins; later calls only
/// adjust the level.
pub fn init(sink: Sink, level: LevelFilter) {
    LOGGER.sink.call_once(|| sink);
    // Fails only if a logger is already installed, which is fine.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
