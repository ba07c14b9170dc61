/// Configuration system
///
/// - `schemas`: every config section, declared once with defaults
/// - `utils`: loading from TOML and the host-wide read-only instance
///
/// Library components receive their sections explicitly (`BusConfig`,
/// `BrokerConfig`, ...); only the host binary reads the global instance.
#[macro_use]
pub mod macros;
pub mod schemas;
pub mod utils;

pub use schemas::*;
pub use utils::{is_config_initialized, load_config_from_path, parse_config, set_config, with_config};
