// =============================================================================
// Ember — Kernel Logger (kprint! / kprintln! + `log` backend)
// =============================================================================
//
// Two layers of output:
//   - kprint!() / kprintln!() write straight to the spinlocked COM1 port
//     and work from the very first instruction of kmain().
//   - The `log` crate's macros (log::info! etc.) go through `SerialLogger`,
//     which prefixes a colored level tag. Installed by `init()`.
//
// Each kprintln!() call is atomic with respect to other cores; message
// ordering across cores is not defined.
// =============================================================================

use core::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// The internal print function behind the `kprint!`/`kprintln!` macros.
#[doc(hidden)]
pub fn _kprint(args: fmt::Arguments) {
    #[cfg(not(test))]
    {
        use core::fmt::Write;
        let mut serial = crate::arch::serial::SERIAL.lock();
        let _ = serial.write_fmt(args);
    }
    #[cfg(test)]
    {
        std::print!("{}", args);
    }
}

/// Prints formatted text to the serial console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::util::logger::_kprint(format_args!($($arg)*))
    };
}

/// Prints formatted text followed by a newline to the serial console.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

/// `log::Log` backend writing leveled, colored records to serial.
struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90m",
        Level::Debug => "\x1b[36m",
        Level::Info => "\x1b[32m",
        Level::Warn => "\x1b[33m",
        Level::Error => "\x1b[31m",
    }
}

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            kprintln!(
                "{}[{:>5}]\x1b[0m {}",
                level_color(record.level()),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Initializes the serial port and installs the `log` backend.
///
/// Called once, before anything else in kmain(); `log` macros used earlier
/// are silently dropped.
pub fn init() {
    #[cfg(not(test))]
    crate::arch::serial::SERIAL.lock().init();
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Trace));
}
