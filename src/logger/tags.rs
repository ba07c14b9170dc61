/// Log tags - one per subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Bus,
    Bridge,
    Stomp,
    Dispatcher,
    Scheduler,
    Services,
    Rest,
    Config,
    /// Records coming from dependencies through the `log` facade
    External,
    Test,
    Other(String),
}

impl LogTag {
    /// Key used by --debug-<key> / --verbose-<key> flags
    pub fn to_debug_key(&self) -> String {
        match self {
            LogTag::System => "system".to_string(),
            LogTag::Bus => "bus".to_string(),
            LogTag::Bridge => "bridge".to_string(),
            LogTag::Stomp => "stomp".to_string(),
            LogTag::Dispatcher => "dispatcher".to_string(),
            LogTag::Scheduler => "scheduler".to_string(),
            LogTag::Services => "services".to_string(),
            LogTag::Rest => "rest".to_string(),
            LogTag::Config => "config".to_string(),
            LogTag::External => "external".to_string(),
            LogTag::Test => "test".to_string(),
            LogTag::Other(s) => s.to_lowercase(),
        }
    }

    /// Uncolored label used in the console prefix
    pub fn label(&self) -> String {
        match self {
            LogTag::Other(s) => s.to_uppercase(),
            LogTag::Dispatcher => "DISPATCH".to_string(),
            LogTag::Scheduler => "SCHEDULE".to_string(),
            LogTag::Services => "SERVICES".to_string(),
            LogTag::External => "EXTERN".to_string(),
            other => other.to_debug_key().to_uppercase(),
        }
    }
}
