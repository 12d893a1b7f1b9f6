// kernel/src/serial.rs
//
// The console.  Everything the kernel or a user environment prints
// (serial_print!, cputs, log records) goes through one locked writer.
//
// The writer has two outputs:
//   - a host hook, installed by whoever runs the kernel (the launcher
//     points it at stdout)
//   - a bounded capture buffer, so tests and the monitor can read back
//     what was printed
//
// Do NOT print while holding the kernel lock from inside a log sink that
// itself takes the kernel lock.

use alloc::string::String;
use core::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Bytes of console output kept for `take_output`.
const CAPTURE_LIMIT: usize = 64 * 1024;

// ============================================================================
// Locked writer
// ============================================================================

static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

struct Serial {
    hook: Option<fn(&str)>,
    capture: String,
}

impl Serial {
    const fn new() -> Self {
        Self {
            hook: None,
            capture: String::new(),
        }
    }

    fn write_str_inner(&mut self, s: &str) {
        if let Some(hook) = self.hook {
            hook(s);
        }
        if self.capture.len() + s.len() > CAPTURE_LIMIT {
            // Keep the newest output.
            let keep = CAPTURE_LIMIT.saturating_sub(s.len());
            let cut = self.capture.len().saturating_sub(keep);
            let cut = (cut..=self.capture.len())
                .find(|&i| self.capture.is_char_boundary(i))
                .unwrap_or(self.capture.len());
            self.capture.drain(..cut);
        }
        self.capture.push_str(s);
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str_inner(s);
        Ok(())
    }
}

/// Send console output to `hook` as well as the capture buffer.
pub fn set_output_hook(hook: fn(&str)) {
    SERIAL.lock().hook = Some(hook);
}

/// Drain the capture buffer.
pub fn take_output() -> String {
    core::mem::take(&mut SERIAL.lock().capture)
}

/// Write a raw string, as `cputs` does.
pub fn puts(s: &str) {
    SERIAL.lock().write_str_inner(s);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Serial::write_str never fails.
    let _ = SERIAL.lock().write_fmt(args);
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

// ============================================================================
// log backend
// ============================================================================

/// `log` records rendered as `[LEVEL] target: message` on the console.
pub struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger.  Later calls only change the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
