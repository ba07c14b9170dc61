/// Configuration schemas - all config structures defined once with defaults
use crate::config_struct;
use std::time::Duration;

// ============================================================================
// BUS CONFIGURATION
// ============================================================================

config_struct! {
    /// Local event bus settings
    pub struct BusConfig {
        /// Per-subscription queue bound; overflow surfaces SlowConsumer
        subscription_buffer: usize = 64,
        /// Publish/listen on unknown channels fails instead of auto-creating
        strict_channels: bool = false,
    }
}

// ============================================================================
// BROKER CONFIGURATION
// ============================================================================

config_struct! {
    /// Remote broker connection settings
    pub struct BrokerConfig {
        /// Host binary only: bridge service channels to the broker
        enabled: bool = false,
        username: String = "guest".to_string(),
        password: String = "guest".to_string(),
        server_addr: String = "localhost:30080".to_string(),
        use_ws: bool = true,
        ws_path: String = "/ws".to_string(),
        use_tls: bool = false,
        /// Prefix prepended to a mapped destination for outbound sends
        publish_prefix: String = "/pub".to_string(),
        connect_timeout_secs: u64 = 10,
        /// STOMP heart-beat interval offered to the server (0 = none)
        heartbeat_ms: u64 = 0,
        /// Inbound frame queue between transport and bridge reader
        inbound_buffer: usize = 1024,
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// WebSocket URL for the configured server
    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let path = if self.ws_path.starts_with('/') {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        };
        format!("{}://{}{}", scheme, self.server_addr, path)
    }

    /// Destination used when forwarding local publishes for `destination`
    pub fn publish_destination(&self, destination: &str) -> String {
        format!("{}{}", self.publish_prefix, destination)
    }
}

// ============================================================================
// DISPATCHER CONFIGURATION
// ============================================================================

config_struct! {
    /// Request/response dispatcher settings
    pub struct DispatcherConfig {
        /// Per-request deadline in milliseconds (0 = no deadline)
        request_timeout_ms: u64 = 0,
    }
}

impl DispatcherConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

// ============================================================================
// SERVICES CONFIGURATION
// ============================================================================

config_struct! {
    /// Joke service settings
    pub struct JokeServiceConfig {
        enabled: bool = true,
        api_url: String = "https://icanhazdadjoke.com".to_string(),
    }
}

config_struct! {
    /// Random word service settings
    pub struct RandomWordServiceConfig {
        enabled: bool = true,
        api_url: String = "https://random-word-api.herokuapp.com/word".to_string(),
        word_count: usize = 500,
        tick_ms: u64 = 1000,
    }
}

config_struct! {
    pub struct ServicesConfig {
        joke: JokeServiceConfig = JokeServiceConfig::default(),
        random_word: RandomWordServiceConfig = RandomWordServiceConfig::default(),
    }
}

// ============================================================================
// ROOT
// ============================================================================

config_struct! {
    pub struct Config {
        bus: BusConfig = BusConfig::default(),
        broker: BrokerConfig = BrokerConfig::default(),
        dispatcher: DispatcherConfig = DispatcherConfig::default(),
        services: ServicesConfig = ServicesConfig::default(),
    }
}
