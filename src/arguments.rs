/// Centralized argument handling for the galaxybus host
///
/// Features:
/// - Process-wide CMD_ARGS storage with thread-safe access
/// - Flag and value lookup helpers
/// - Debug flag checks per subsystem
use once_cell::sync::Lazy;
use std::env;
use std::sync::Mutex;

/// Global command-line arguments storage
/// Tests override it with `set_cmd_args`
pub static CMD_ARGS: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(env::args().collect()));

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/galaxybus.toml";

pub fn set_cmd_args(args: Vec<String>) {
    if let Ok(mut cmd_args) = CMD_ARGS.lock() {
        *cmd_args = args;
    }
}

/// Gets a copy of the current command-line arguments
pub fn get_cmd_args() -> Vec<String> {
    match CMD_ARGS.lock() {
        Ok(args) => args.clone(),
        Err(_) => env::args().collect(),
    }
}

pub fn has_arg(arg: &str) -> bool {
    get_cmd_args().iter().any(|a| a == arg)
}

/// Gets the value that follows a flag, supporting both `--flag value` and `--flag=value`
pub fn get_arg_value(flag: &str) -> Option<String> {
    let args = get_cmd_args();
    let prefix = format!("{}=", flag);
    for (i, arg) in args.iter().enumerate() {
        if arg == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        if let Some(value) = arg.strip_prefix(&prefix) {
            return Some(value.to_string());
        }
    }
    None
}

// =============================================================================
// HOST OPTIONS
// =============================================================================

/// Config file path (--config <path>)
pub fn get_config_path() -> String {
    get_arg_value("--config").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Broker address override (--broker host:port); implies broker.enabled
pub fn get_broker_override() -> Option<String> {
    get_arg_value("--broker")
}

pub fn is_help_requested() -> bool {
    has_arg("--help") || has_arg("-h")
}

// =============================================================================
// DEBUG FLAG CHECKING FUNCTIONS
// =============================================================================

pub fn is_debug_bus_enabled() -> bool {
    has_arg("--debug-bus")
}

pub fn is_debug_bridge_enabled() -> bool {
    has_arg("--debug-bridge")
}

pub fn is_debug_services_enabled() -> bool {
    has_arg("--debug-services")
}

/// Print the enabled debug modes at startup
pub fn print_debug_info() {
    let enabled: Vec<String> = get_cmd_args()
        .into_iter()
        .filter(|a| a.starts_with("--debug-") || a.starts_with("--verbose"))
        .collect();
    if !enabled.is_empty() {
        crate::logger::info(
            crate::logger::LogTag::System,
            &format!("Debug modes enabled: {}", enabled.join(", ")),
        );
    }
}

pub fn print_help() {
    println!("galaxybus - event bus service host");
    println!();
    println!("USAGE:");
    println!("    galaxybus [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <path>       Config file (default: {})", DEFAULT_CONFIG_PATH);
    println!("    --broker <host:port>  Bridge service channels to this broker");
    println!("    --verbose             Show verbose logs");
    println!("    --quiet               Only warnings and errors");
    println!("    --debug-<tag>         Debug logs for one subsystem");
    println!("                          (bus, bridge, stomp, dispatcher, scheduler, services, rest)");
    println!("    -h, --help            Print this help");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_value_forms() {
        set_cmd_args(vec![
            "galaxybus".to_string(),
            "--config".to_string(),
            "a.toml".to_string(),
            "--broker=localhost:61613".to_string(),
            "--debug-bus".to_string(),
        ]);
        assert_eq!(get_config_path(), "a.toml");
        assert_eq!(get_broker_override().as_deref(), Some("localhost:61613"));
        assert!(is_debug_bus_enabled());
        assert!(!is_debug_bridge_enabled());
        assert_eq!(get_arg_value("--missing"), None);
    }
}
