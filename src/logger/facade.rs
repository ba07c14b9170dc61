/// `log` crate adapter
///
/// tungstenite and reqwest report through the `log` facade. Their records are
/// printed under `LogTag::External` with the same filtering rules, except that
/// their Info chatter is demoted to Debug.
use super::core::log_internal;
use super::levels::LogLevel;
use super::tags::LogTag;

struct FacadeLogger;

static FACADE: FacadeLogger = FacadeLogger;

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Warn || super::is_debug_enabled(LogTag::External)
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match LogLevel::from_log(record.level()) {
            LogLevel::Info => LogLevel::Debug,
            other => other,
        };
        let message = format!("{}: {}", record.target(), record.args());
        log_internal(LogTag::External, level, &message);
    }

    fn flush(&self) {}
}

/// Install once; a second install (tests, embedded use) is ignored
pub fn install() {
    if log::set_logger(&FACADE).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}
