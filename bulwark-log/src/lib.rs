//! Bulwark Logging
//!
//! Installs a `tracing` subscriber configured from `BULWARK_*` environment
//! variables. Every Bulwark crate emits structured `tracing` events (breaker
//! transitions, bulkhead rejections, retry attempts); this crate decides
//! where they go and how much of them is kept.
//!
//! # Usage
//!
//! ```rust
//! use bulwark_log::{info, warn};
//!
//! bulwark_log::init();
//!
//! info!(dependency = "amqp", "Publisher connected");
//! warn!(dependency = "amqp", attempt = 2, "Publish retried");
//! ```
//!
//! # Environment Variables
//!
//! - `BULWARK_DEBUG=1` - Enable debug logging
//! - `BULWARK_LOG_LEVEL=trace|debug|info|warn|error|off` - Set log level
//! - `BULWARK_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `BULWARK_LOG_COLOR=1|0` - Enable/disable colors
//! - `BULWARK_LOG_MODULE=1|0` - Include the event target
//!
//! `RUST_LOG`, when set, takes precedence over `BULWARK_LOG_LEVEL` for the
//! initial filter.

use once_cell::sync::{Lazy, OnceCell};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

pub use tracing::{debug, error, info, trace, warn};
pub use tracing_subscriber::util::TryInitError;

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for Bulwark logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Get level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    /// The `EnvFilter` directive for this level.
    pub fn directive(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            4 => Level::Error,
            _ => Level::Off,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Multi-line, human oriented
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl Format {
    /// Get format from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

static CONFIG: Lazy<LogConfig> = Lazy::new(|| {
    let config = LogConfig::from_env();
    DEBUG_ENABLED.store(config.debug, Ordering::SeqCst);
    LOG_LEVEL.store(config.level as u8, Ordering::SeqCst);
    config
});

// Filter handle of the installed subscriber, used by `set_level`.
static FILTER: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether colors are enabled
    pub color: bool,
    /// Whether to include the event target
    pub module_path: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            color: false,
            module_path: true,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| {
            lookup(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let debug = flag("BULWARK_DEBUG").unwrap_or(false);

        let level = lookup("BULWARK_LOG_LEVEL")
            .and_then(|s| Level::from_str(&s))
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = lookup("BULWARK_LOG_FORMAT")
            .and_then(|s| Format::from_str(&s))
            .unwrap_or(Format::Json);

        let color = flag("BULWARK_LOG_COLOR")
            .unwrap_or_else(|| lookup("NO_COLOR").is_none() && lookup("TERM").is_some());

        let module_path = flag("BULWARK_LOG_MODULE").unwrap_or(true);

        Self {
            debug,
            level,
            format,
            color: color && format != Format::Json,
            module_path,
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Install the global subscriber, ignoring the error if one is already set.
pub fn init() {
    let _ = try_init();
}

/// Install the global subscriber.
pub fn try_init() -> Result<(), TryInitError> {
    subscriber().try_init()
}

/// Build a subscriber from the global configuration.
///
/// The first subscriber built is the one [`set_level`] adjusts.
pub fn subscriber() -> impl tracing::Subscriber + Send + Sync + 'static {
    let config = config();

    let initial = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.directive()));
    let (filter, handle) = reload::Layer::new(initial);
    let _ = FILTER.set(handle);

    let output = match config.format {
        Format::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.color)
            .with_target(config.module_path)
            .boxed(),
        Format::Compact => fmt::layer()
            .compact()
            .with_ansi(config.color)
            .with_target(config.module_path)
            .boxed(),
        Format::Json => fmt::layer()
            .json()
            .with_target(config.module_path)
            .boxed(),
    };

    tracing_subscriber::registry().with(filter).with(output)
}

/// Check if debug logging is enabled.
#[inline]
pub fn is_debug_enabled() -> bool {
    Lazy::force(&CONFIG);
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Check if a log level is enabled.
#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    level != Level::Off && level >= current_level()
}

/// Get current log level.
pub fn current_level() -> Level {
    Lazy::force(&CONFIG);
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level at runtime. Also replaces the installed filter.
pub fn set_level(level: Level) {
    Lazy::force(&CONFIG);
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(handle) = FILTER.get()
        && let Err(err) = handle.reload(EnvFilter::new(level.directive()))
    {
        eprintln!("bulwark-log: failed to change log level: {}", err);
    }
}

/// Enable or disable debug mode at runtime.
pub fn set_debug(enabled: bool) {
    Lazy::force(&CONFIG);
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    if enabled && current_level() > Level::Debug {
        set_level(Level::Debug);
    }
}

/// Get the global configuration.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!(Level::from_str("debug"), Some(Level::Debug));
        assert_eq!(Level::from_str("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::from_str("warning"), Some(Level::Warn));
        assert_eq!(Level::from_str("invalid"), None);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!(Format::from_str("pretty"), Some(Format::Pretty));
        assert_eq!(Format::from_str("compact"), Some(Format::Compact));
        assert_eq!(Format::from_str("JSON"), Some(Format::Json));
        assert_eq!(Format::from_str("xml"), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert!(!config.debug);
        assert_eq!(config.level, Level::Info);
        assert_eq!(config.format, Format::Json);
        assert!(!config.color);
    }

    #[test]
    fn test_debug_implies_debug_level() {
        let config = LogConfig::from_lookup(lookup(&[("BULWARK_DEBUG", "true")]));
        assert!(config.debug);
        assert_eq!(config.level, Level::Debug);

        let config = LogConfig::from_lookup(lookup(&[
            ("BULWARK_DEBUG", "1"),
            ("BULWARK_LOG_LEVEL", "warn"),
        ]));
        assert_eq!(config.level, Level::Warn);
    }

    #[test]
    fn test_color_follows_terminal() {
        let config = LogConfig::from_lookup(lookup(&[
            ("BULWARK_LOG_FORMAT", "compact"),
            ("TERM", "xterm"),
        ]));
        assert!(config.color);

        let config = LogConfig::from_lookup(lookup(&[
            ("BULWARK_LOG_FORMAT", "compact"),
            ("TERM", "xterm"),
            ("NO_COLOR", "1"),
        ]));
        assert!(!config.color);

        let config = LogConfig::from_lookup(lookup(&[
            ("BULWARK_LOG_FORMAT", "pretty"),
            ("BULWARK_LOG_COLOR", "0"),
            ("TERM", "xterm"),
        ]));
        assert!(!config.color);
    }

    #[test]
    fn test_set_level() {
        let original = current_level();

        set_level(Level::Error);
        assert_eq!(current_level(), Level::Error);
        assert!(is_level_enabled(Level::Error));
        assert!(!is_level_enabled(Level::Warn));

        set_level(original);
    }

    #[test]
    fn test_off_is_never_enabled() {
        assert!(!is_level_enabled(Level::Off));
    }
}
