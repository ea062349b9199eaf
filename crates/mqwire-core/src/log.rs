//! Leveled stderr logging for mqwire
//!
//! Thread-safe, optionally-flushing debug output. The engine loops log
//! through these macros; there is no logger registration step.
//!
//! # Environment Variables
//!
//! - `MQWIRE_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `MQWIRE_FLUSH_LOG=1` - Flush stderr after each print (useful when debugging crashes)

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let flush = crate::env::env_get_bool("MQWIRE_FLUSH_LOG", false);
    FLUSH_ENABLED.store(flush, Ordering::Relaxed);

    if let Ok(val) = std::env::var("MQWIRE_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// True when a message at `level` should be emitted
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level <= log_level() && level != LogLevel::Off
}

/// Write one formatted line to stderr, flushing if configured
pub fn emit(level: LogLevel, source: &str, args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = writeln!(handle, "{} [{}] {}", level.prefix(), source, args);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Log at error level. First argument is the source tag.
#[macro_export]
macro_rules! log_error {
    ($src:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Error) {
            $crate::log::emit($crate::log::LogLevel::Error, $src, format_args!($($arg)*));
        }
    };
}

/// Log at warn level. First argument is the source tag.
#[macro_export]
macro_rules! log_warn {
    ($src:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Warn) {
            $crate::log::emit($crate::log::LogLevel::Warn, $src, format_args!($($arg)*));
        }
    };
}

/// Log at info level. First argument is the source tag.
#[macro_export]
macro_rules! log_info {
    ($src:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Info) {
            $crate::log::emit($crate::log::LogLevel::Info, $src, format_args!($($arg)*));
        }
    };
}

/// Log at debug level. First argument is the source tag.
#[macro_export]
macro_rules! log_debug {
    ($src:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::emit($crate::log::LogLevel::Debug, $src, format_args!($($arg)*));
        }
    };
}

/// Log at trace level. First argument is the source tag.
#[macro_export]
macro_rules! log_trace {
    ($src:expr, $($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::emit($crate::log::LogLevel::Trace, $src, format_args!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Debug);
        assert!(LogLevel::Off < LogLevel::Error);
    }

    #[test]
    fn test_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(4), LogLevel::Debug);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_set_level() {
        set_log_level(LogLevel::Error);
        assert!(enabled(LogLevel::Error));
        assert!(!enabled(LogLevel::Debug));
        set_log_level(LogLevel::Warn);
    }
}
