//! Leveled logging macros for the strand runtime
//!
//! Thread-safe line-oriented logging with a configurable sink. The sink is
//! stderr until `init` points it at a file; `free` restores stderr.
//!
//! # Environment Variables
//!
//! - `STRAND_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!
//! # Usage
//!
//! ```ignore
//! use strand_core::{say_error, say_info};
//!
//! say_info!("cord '{}' started", name);
//! say_error!("fiber '{}' raised: {}", name, err);
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Log levels (matches common conventions)
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

    fn name(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Line format for the configured sink
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `<ts> [LEVEL] message`
    Plain = 0,
    /// One JSON object per line
    Json = 1,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Plain as u8);
static NONBLOCK: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// File sink; None means stderr
static SINK: Mutex<Option<File>> = Mutex::new(None);

/// Initialize the logger
///
/// `path == None` keeps the stderr sink. `nonblock` skips the per-line
/// flush (lines still reach the sink when the OS buffer drains).
pub fn init(
    path: Option<&str>,
    level: LogLevel,
    nonblock: bool,
    format: LogFormat,
) -> std::io::Result<()> {
    let level = env_level().unwrap_or(level);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
    NONBLOCK.store(nonblock, Ordering::Relaxed);

    let mut sink = SINK.lock().unwrap();
    *sink = match path {
        Some(p) => Some(OpenOptions::new().create(true).append(true).open(p)?),
        None => None,
    };
    INITIALIZED.store(true, Ordering::SeqCst);
    Ok(())
}

/// Close the file sink and restore stderr
pub fn free() {
    let mut sink = SINK.lock().unwrap();
    *sink = None;
    INITIALIZED.store(false, Ordering::SeqCst);
}

/// Set the level programmatically
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current level
#[inline]
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Check if a level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

fn env_level() -> Option<LogLevel> {
    let val = std::env::var("STRAND_LOG_LEVEL").ok()?;
    Some(match val.to_lowercase().as_str() {
        "off" | "0" => LogLevel::Off,
        "error" | "1" => LogLevel::Error,
        "warn" | "2" => LogLevel::Warn,
        "info" | "3" => LogLevel::Info,
        "debug" | "4" => LogLevel::Debug,
        "trace" | "5" => LogLevel::Trace,
        _ => return None,
    })
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Internal: format and write one log line
#[doc(hidden)]
pub fn _say_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let msg = args.to_string();
    let line = match LOG_FORMAT.load(Ordering::Relaxed) {
        f if f == LogFormat::Json as u8 => format!(
            "{{\"time\":\"{}\",\"level\":\"{}\",\"message\":\"{}\"}}\n",
            timestamp(),
            level.name(),
            json_escape(&msg)
        ),
        _ => format!("{} {} {}\n", timestamp(), level.prefix(), msg),
    };

    let mut sink = SINK.lock().unwrap();
    match sink.as_mut() {
        Some(file) => {
            let _ = file.write_all(line.as_bytes());
            if !NONBLOCK.load(Ordering::Relaxed) {
                let _ = file.flush();
            }
        }
        None => {
            let stderr = std::io::stderr();
            let mut handle = stderr.lock();
            let _ = handle.write_all(line.as_bytes());
        }
    }
}

/// Error level log
#[macro_export]
macro_rules! say_error {
    ($($arg:tt)*) => {{
        $crate::say::_say_impl($crate::say::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! say_warn {
    ($($arg:tt)*) => {{
        $crate::say::_say_impl($crate::say::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! say_info {
    ($($arg:tt)*) => {{
        $crate::say::_say_impl($crate::say::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! say_debug {
    ($($arg:tt)*) => {{
        $crate::say::_say_impl($crate::say::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! say_trace {
    ($($arg:tt)*) => {{
        $crate::say::_say_impl($crate::say::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_from_u8() {
        assert_eq!(LogLevel::from_u8(0), LogLevel::Off);
        assert_eq!(LogLevel::from_u8(1), LogLevel::Error);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_json_escape() {
        assert_eq!(json_escape("plain"), "plain");
        assert_eq!(json_escape("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn test_macros_compile() {
        let save = log_level();
        set_log_level(LogLevel::Off);

        say_error!("error {}", "msg");
        say_warn!("warn");
        say_info!("info");
        say_debug!("debug");
        say_trace!("trace");

        set_log_level(save);
    }
}
