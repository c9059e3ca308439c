//! Kernel-style print macros for silk
//!
//! Thread-safe, leveled debug output on stderr, in the spirit of printk.
//!
//! # Environment Variables
//!
//! - `SILK_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!   (names accepted too)
//! - `SILK_LOG_FLUSH=1` - flush stderr after each line (useful when debugging
//!   crashes)
//!
//! # Usage
//!
//! ```ignore
//! kinfo!("scheduler {} started", name);
//! kwarn!("unexpected state: {}", state);
//! ```

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
    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from environment variables
///
/// Called automatically on first use; call explicitly for deterministic
/// startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("SILK_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("SILK_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Set the log level programmatically (overrides the environment)
pub fn set_level(level: LogLevel) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check whether a message at `level` would be emitted
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    (level as u8) <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Emit one formatted line. Use through the macros, not directly.
pub fn write(level: LogLevel, args: core::fmt::Arguments<'_>) {
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("?");

    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "{} [{}] {}", level.prefix(), name, args);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Log at an explicit level
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        let lvl = $level;
        if $crate::klog::enabled(lvl) {
            $crate::klog::write(lvl, ::core::format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::klog::LogLevel::Trace, $($arg)*) };
}
