//! Per-component loggers.
//!
//! Control via DEBUG environment variable:
//! - `DEBUG=*` - Enable all loggers
//! - `DEBUG=bridge` - Enable only the remote-call bridge
//! - `DEBUG=bridge,elfldr` - Enable multiple
//!
//! Verbosity via DEBUG_VERBOSITY (0-3, default 1)
//!
//! Enabled loggers emit through the `log` facade with the logger name as the
//! record target. Nothing is printed unless the embedder installs a `log`
//! backend; [`init`] installs a minimal stderr one.

use std::collections::HashSet;
use std::env;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone)]
enum EnabledConfig {
    All,
    None,
    Some(HashSet<String>),
}

struct GlobalConfig {
    enabled: EnabledConfig,
    verbosity: u8,
}

static CONFIG: OnceLock<GlobalConfig> = OnceLock::new();

fn parse_enabled(value: Option<&str>) -> EnabledConfig {
    match value {
        None | Some("") => EnabledConfig::None,
        Some("*") | Some("1") | Some("true") => EnabledConfig::All,
        Some(value) => {
            let set: HashSet<_> = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if set.is_empty() {
                EnabledConfig::None
            } else {
                EnabledConfig::Some(set)
            }
        }
    }
}

fn get_config() -> &'static GlobalConfig {
    CONFIG.get_or_init(|| {
        let enabled = parse_enabled(env::var("DEBUG").ok().as_deref());
        let verbosity = env::var("DEBUG_VERBOSITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(|v: u8| v.min(3))
            .unwrap_or(1);
        GlobalConfig { enabled, verbosity }
    })
}

fn is_enabled(name: &str) -> bool {
    match &get_config().enabled {
        EnabledConfig::None => false,
        EnabledConfig::All => true,
        EnabledConfig::Some(set) => set.contains(name),
    }
}

fn verbosity() -> u8 {
    get_config().verbosity
}

// ============================================================================
// Logger
// ============================================================================

pub struct Logger {
    name: &'static str,
    enabled: bool,
    indent: AtomicUsize,
}

impl Logger {
    pub const fn disabled() -> Self {
        Self { name: "", enabled: false, indent: AtomicUsize::new(0) }
    }

    fn active(name: &'static str) -> Self {
        Self { name, enabled: true, indent: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn indent(&self) -> String {
        "  ".repeat(self.indent.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn log(&self, msg: &str) {
        if self.enabled && verbosity() >= 1 {
            log::info!(target: self.name, "{}{}", self.indent(), msg);
        }
    }

    #[inline]
    pub fn detail(&self, msg: &str) {
        if self.enabled && verbosity() >= 2 {
            log::debug!(target: self.name, "{}{}", self.indent(), msg);
        }
    }

    #[inline]
    pub fn success(&self, msg: &str) {
        if self.enabled && verbosity() >= 1 {
            log::info!(target: self.name, "{}OK: {}", self.indent(), msg);
        }
    }

    #[inline]
    pub fn fail(&self, msg: &str) {
        if self.enabled && verbosity() >= 1 {
            log::warn!(target: self.name, "{}FAIL: {}", self.indent(), msg);
        }
    }

    #[inline]
    pub fn push_indent(&self) {
        if self.enabled {
            self.indent.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn pop_indent(&self) {
        if self.enabled {
            let _ = self.indent.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 { Some(v - 1) } else { Some(0) }
            });
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Create a logger. The name must be a static string.
pub fn create_logger(name: &'static str) -> Logger {
    if is_enabled(name) {
        Logger::active(name)
    } else {
        Logger::disabled()
    }
}

// ============================================================================
// Stderr sink
// ============================================================================

struct StderrSink;

impl log::Log for StderrSink {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{}] {}", record.target(), record.args());
    }

    fn flush(&self) {}
}

static SINK: StderrSink = StderrSink;

/// Install a stderr backend for the `log` facade.
///
/// The maximum level follows DEBUG_VERBOSITY. Returns false if another
/// backend was already installed.
pub fn init() -> bool {
    let level = match verbosity() {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    match log::set_logger(&SINK) {
        Ok(()) => {
            log::set_max_level(level);
            true
        }
        Err(_) => false,
    }
}

// ============================================================================
// Macros - avoid format! cost when disabled
// ============================================================================

#[macro_export]
macro_rules! log {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.log(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_detail {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.detail(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_success {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.success(&format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_fail {
    ($logger:expr, $($arg:tt)*) => {
        if $logger.enabled() {
            $logger.fail(&format!($($arg)*));
        }
    };
}
