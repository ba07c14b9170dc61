use galaxybus::{
    arguments::{get_broker_override, get_config_path, is_help_requested, print_debug_info, print_help},
    bus::EventBus,
    config::{load_config_from_path, set_config, with_config, Config},
    logger::{self, LogTag},
    services::{JokeService, RandomWordService, ServiceHost},
};
use std::sync::Arc;

/// galaxybus service host
///
/// Loads the config, optionally connects the broker, starts the enabled demo
/// services and runs until Ctrl+C.
#[tokio::main]
async fn main() {
    logger::init();

    if is_help_requested() {
        print_help();
        std::process::exit(0);
    }

    logger::info(LogTag::System, "galaxybus starting up...");
    print_debug_info();

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    let config_path = get_config_path();
    let mut config: Config = match load_config_from_path(&config_path) {
        Ok(config) => config,
        Err(e) => {
            logger::error(LogTag::Config, &e);
            std::process::exit(1);
        }
    };
    if let Some(addr) = get_broker_override() {
        config.broker.enabled = true;
        config.broker.server_addr = addr;
    }
    if let Err(e) = set_config(config) {
        logger::error(LogTag::Config, &e);
        std::process::exit(1);
    }

    let (bus_config, broker_config, dispatcher_config, services_config) = with_config(|c| {
        (
            c.bus.clone(),
            c.broker.clone(),
            c.dispatcher.clone(),
            c.services.clone(),
        )
    });

    let bus = EventBus::new(bus_config);

    // =========================================================================
    // BROKER
    // =========================================================================

    let broker = if broker_config.enabled {
        match connect_broker(&bus, &broker_config).await {
            Ok(connection) => Some(connection),
            Err(e) => {
                logger::error(LogTag::Bridge, &format!("Broker connection failed: {}", e));
                std::process::exit(1);
            }
        }
    } else {
        logger::info(LogTag::Bridge, "Broker disabled, running local-only");
        None
    };

    // =========================================================================
    // SERVICES
    // =========================================================================

    let mut host = match ServiceHost::new(bus.clone(), dispatcher_config) {
        Ok(host) => host,
        Err(e) => {
            logger::error(LogTag::Services, &e);
            std::process::exit(1);
        }
    };
    if let Some(connection) = broker {
        host = host.with_broker(connection);
    }

    let mut registered = Vec::new();
    if services_config.joke.enabled {
        registered.push(host.register(Arc::new(JokeService::new(services_config.joke.clone()))));
    }
    if services_config.random_word.enabled {
        registered.push(host.register(Arc::new(RandomWordService::new(
            services_config.random_word.clone(),
        ))));
    }
    if let Some(Err(e)) = registered.into_iter().find(|r| r.is_err()) {
        logger::error(LogTag::Services, &e);
        std::process::exit(1);
    }

    if let Err(e) = host.start_all().await {
        logger::error(LogTag::Services, &format!("Startup failed: {}", e));
        let _ = host.stop_all().await;
        let _ = bus.disconnect_all().await;
        std::process::exit(1);
    }

    // =========================================================================
    // RUN UNTIL CTRL+C
    // =========================================================================

    let shutdown = host.shutdown_signal();
    let signal = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\n[SIGNAL] Received Ctrl+C, shutting down...");
        signal.notify_one();
    }) {
        logger::error(LogTag::System, &format!("Failed to install Ctrl+C handler: {}", e));
        std::process::exit(1);
    }

    logger::info(
        LogTag::System,
        &format!("Running services: {}", host.service_names().join(", ")),
    );
    shutdown.notified().await;

    if let Err(e) = host.stop_all().await {
        logger::error(LogTag::Services, &e);
    }
    if let Err(e) = bus.disconnect_all().await {
        logger::warning(LogTag::Bridge, &format!("Broker disconnect failed: {}", e));
    }
    logger::info(LogTag::System, "galaxybus stopped");
}

#[cfg(feature = "stomp")]
async fn connect_broker(
    bus: &EventBus,
    config: &galaxybus::config::BrokerConfig,
) -> Result<galaxybus::BrokerConnection, galaxybus::BusError> {
    logger::info(
        LogTag::Bridge,
        &format!("Connecting to broker at {}", config.ws_url()),
    );
    bus.connect_broker(config, &galaxybus::bridge::StompConnector::default())
        .await
}

#[cfg(not(feature = "stomp"))]
async fn connect_broker(
    _bus: &EventBus,
    config: &galaxybus::config::BrokerConfig,
) -> Result<galaxybus::BrokerConnection, galaxybus::BusError> {
    Err(galaxybus::BusError::ConnectionError {
        endpoint: config.server_addr.clone(),
        reason: "built without the stomp feature".to_string(),
    })
}
