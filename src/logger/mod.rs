//! Structured logging for galaxybus
//!
//! Tag-based console logger:
//! - Standard log levels (Error/Warning/Info/Debug/Verbose)
//! - Per-subsystem debug control via --debug-<tag> flags
//! - Colored, timestamped, word-wrapped console output
//! - Third-party `log` records routed through the same formatter
//!
//! ## Usage
//!
//! ```rust,ignore
//! use galaxybus::logger::{self, LogTag};
//!
//! logger::error(LogTag::Bridge, "Handshake rejected");
//! logger::info(LogTag::Services, "joke-service running");
//! logger::debug(LogTag::Bus, "fan-out to 3 subscribers"); // Only if --debug-bus
//! logger::verbose(LogTag::Stomp, "raw frame: ..."); // Only if --verbose
//! ```
//!
//! Call `logger::init()` once at startup, before services start.

mod config;
mod core;
mod facade;
mod format;
mod levels;
mod tags;

pub use config::{get_logger_config, init_from_args, set_logger_config, LoggerConfig};
pub use levels::LogLevel;
pub use tags::LogTag;

/// Initialize the logger system
///
/// Reads debug/verbose flags from the command line and installs the `log`
/// facade adapter so dependency logs share our format.
pub fn init() {
    config::init_from_args();
    facade::install();
}

/// Log at ERROR level (always shown)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (standard operations)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level - only shown with --debug-<tag>
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level - only shown with --verbose or --verbose-<tag>
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}

/// Whether a debug line for this tag would be printed
///
/// Lets hot paths skip building expensive debug strings.
pub fn is_debug_enabled(tag: LogTag) -> bool {
    core::should_log(&tag, LogLevel::Debug)
}
