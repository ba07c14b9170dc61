/// Configuration utilities - loading and host-wide access
use super::schemas::Config;
use crate::logger::{self, LogTag};
use once_cell::sync::{Lazy, OnceCell};
use std::path::Path;

/// Host-wide configuration, set once at startup
static CONFIG: OnceCell<Config> = OnceCell::new();

static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::default);

/// Parse configuration from TOML text
pub fn parse_config(contents: &str) -> Result<Config, String> {
    toml::from_str::<Config>(contents).map_err(|e| format!("Failed to parse config: {}", e))
}

/// Load configuration from a TOML file
///
/// A missing file is not an error: defaults are used and a warning is logged.
/// An unreadable or malformed file is.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config, String> {
    let path = path.as_ref();
    if !path.exists() {
        logger::warning(
            LogTag::Config,
            &format!("Config file '{}' not found, using default values", path.display()),
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

    parse_config(&contents).map_err(|e| format!("{} ({})", e, path.display()))
}

/// Install the host-wide configuration; fails if already set
pub fn set_config(config: Config) -> Result<(), String> {
    CONFIG
        .set(config)
        .map_err(|_| "Config already initialized".to_string())
}

pub fn is_config_initialized() -> bool {
    CONFIG.get().is_some()
}

/// Read the host-wide configuration (defaults if not initialized)
pub fn with_config<F, R>(f: F) -> R
where
    F: FnOnce(&Config) -> R,
{
    f(CONFIG.get().unwrap_or(&DEFAULT_CONFIG))
}
