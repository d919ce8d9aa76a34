//! Logging utils. See the [`log`](https://docs.rs/log/) crate's own docs
//! for the general model this plugs into.
//!
//! ```no_run
//! use log::{info, LevelFilter};
//! use corevm::log::{RuntimeLogger, RuntimeLevel};
//!
//! static LOGGER: RuntimeLogger = RuntimeLogger::new();
//! log::set_logger(&LOGGER).unwrap();
//! log::set_max_level(LevelFilter::Debug);
//! info!("heap collected {} objects", 12);
//!
//! corevm::rt_warn!("fiber {} missed its deadline", 3);
//! ```
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{Level, Log, Metadata, Record};

/// Mirrors the severities a host embedding this crate would want to route
/// to its own log sink, independent of which [`log::Level`] produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum RuntimeLevel {
    Fatal = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl RuntimeLevel {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Fatal,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Verbose,
            5 => Self::Debug,
            _ => return None,
        })
    }
}

impl From<Level> for RuntimeLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => RuntimeLevel::Error,
            Level::Warn => RuntimeLevel::Warn,
            Level::Info => RuntimeLevel::Info,
            Level::Debug => RuntimeLevel::Debug,
            Level::Trace => RuntimeLevel::Debug,
        }
    }
}

static CURRENT_LEVEL: AtomicU32 = AtomicU32::new(RuntimeLevel::Info as u32);

/// Current level of the process-wide default logger. Set once at startup
/// by the host, not read from the environment by this crate itself (spec
/// §6: config is supplied, never sniffed from the process environment).
pub fn current_level() -> RuntimeLevel {
    RuntimeLevel::from_u32(CURRENT_LEVEL.load(Ordering::Relaxed)).unwrap_or(RuntimeLevel::Info)
}

pub fn set_current_level(level: RuntimeLevel) {
    CURRENT_LEVEL.store(level as u32, Ordering::Relaxed);
}

/// [`log::Log`] implementation that writes to stderr, formatted the way a
/// host embedding this crate alongside its own C/C++ logging would expect:
/// `[level] file:line: message`.
pub struct RuntimeLogger(fn(Level) -> RuntimeLevel);

impl RuntimeLogger {
    #[inline(always)]
    pub const fn new() -> Self {
        const DEFAULT_MAPPING: fn(Level) -> RuntimeLevel = |l: Level| l.into();
        RuntimeLogger(DEFAULT_MAPPING)
    }

    pub fn with_mapping(map_fn: fn(Level) -> RuntimeLevel) -> Self {
        RuntimeLogger(map_fn)
    }

    pub fn convert_level(&self, level: Level) -> RuntimeLevel {
        (self.0)(level)
    }
}

impl Default for RuntimeLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for RuntimeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.convert_level(metadata.level()) <= current_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        rt_say(
            self.convert_level(record.level()),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args(),
        );
    }

    fn flush(&self) {}
}

fn level_tag(level: RuntimeLevel) -> &'static str {
    match level {
        RuntimeLevel::Fatal => "fatal",
        RuntimeLevel::Error => "error",
        RuntimeLevel::Warn => "warn",
        RuntimeLevel::Info => "info",
        RuntimeLevel::Verbose => "verbose",
        RuntimeLevel::Debug => "debug",
    }
}

#[doc(hidden)]
pub fn rt_say(level: RuntimeLevel, file: &str, line: u32, args: std::fmt::Arguments) {
    eprintln!("[{}] {}:{}: {}", level_tag(level), file, line, args);
}

thread_local! {
    /// Suppresses recursive logging from within a fatal hook itself.
    static IN_FATAL_HOOK: Cell<bool> = Cell::new(false);
}

/// Runs `body` with reentrant fatal-logging disabled, used by
/// [`crate::vm::Vm`]'s default fatal hook so a logger that itself panics
/// doesn't recurse into the process abort path.
pub fn guard_against_reentrant_fatal(body: impl FnOnce()) {
    let already = IN_FATAL_HOOK.with(|f| f.replace(true));
    if !already {
        body();
    }
    IN_FATAL_HOOK.with(|f| f.set(already));
}

#[macro_export]
macro_rules! rt_fatal {
    ($($f:tt)*) => {
        $crate::log::rt_say($crate::log::RuntimeLevel::Fatal, file!(), line!(), ::std::format_args!($($f)*))
    }
}

#[macro_export]
macro_rules! rt_error {
    ($($f:tt)*) => {
        $crate::log::rt_say($crate::log::RuntimeLevel::Error, file!(), line!(), ::std::format_args!($($f)*))
    }
}

#[macro_export]
macro_rules! rt_warn {
    ($($f:tt)*) => {
        $crate::log::rt_say($crate::log::RuntimeLevel::Warn, file!(), line!(), ::std::format_args!($($f)*))
    }
}

#[macro_export]
macro_rules! rt_info {
    ($($f:tt)*) => {
        $crate::log::rt_say($crate::log::RuntimeLevel::Info, file!(), line!(), ::std::format_args!($($f)*))
    }
}

#[macro_export]
macro_rules! rt_verbose {
    ($($f:tt)*) => {
        $crate::log::rt_say($crate::log::RuntimeLevel::Verbose, file!(), line!(), ::std::format_args!($($f)*))
    }
}

#[macro_export]
macro_rules! rt_debug {
    ($($f:tt)*) => {
        $crate::log::rt_say($crate::log::RuntimeLevel::Debug, file!(), line!(), ::std::format_args!($($f)*))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mapping_respects_current_level() {
        set_current_level(RuntimeLevel::Info);
        let logger = RuntimeLogger::new();
        assert!(logger.enabled(&log::Metadata::builder().level(Level::Error).build()));
        assert!(!logger.enabled(&log::Metadata::builder().level(Level::Debug).build()));
        set_current_level(RuntimeLevel::Debug);
        assert!(logger.enabled(&log::Metadata::builder().level(Level::Debug).build()));
    }

    #[test]
    fn custom_mapping_overrides_conversion() {
        let logger = RuntimeLogger::with_mapping(|_| RuntimeLevel::Debug);
        set_current_level(RuntimeLevel::Info);
        assert!(!logger.enabled(&log::Metadata::builder().level(Level::Error).build()));
    }
}
