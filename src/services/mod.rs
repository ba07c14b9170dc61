mod health;
pub mod core;
pub mod dispatcher;
pub mod implementations;
pub mod rest;
pub mod rest_bridge;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use self::core::ServiceCore;
pub use dispatcher::{RequestDispatcher, RequestHandler, Responder};
pub use health::ServiceHealth;
pub use implementations::{JokeService, RandomWordService};
pub use rest::{RestClient, RestServiceRequest};
pub use rest_bridge::{RestBridge, RestBridgeConfig, RestCall, RestReply};
pub use scheduler::ScheduledProducer;

use crate::bridge::BrokerConnection;
use crate::bus::{EventBus, Request};
use crate::config::DispatcherConfig;
use crate::logger::{self, LogTag};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Core service trait that all services must implement
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique service identifier
    fn name(&self) -> &'static str;

    /// Channel the service listens on (one channel per service)
    fn channel(&self) -> &str;

    /// Service priority (lower = starts earlier, stops later)
    fn priority(&self) -> i32 {
        100
    }

    /// Commands the service answers; anything else gets `UnknownCommand`
    fn commands(&self) -> Vec<&'static str> {
        vec![]
    }

    /// Remote destination to bridge the channel to when the host has a broker
    fn broker_destination(&self) -> Option<&str> {
        None
    }

    /// Capture the core; called once before readiness
    async fn init(&self, core: ServiceCore) -> Result<(), String>;

    /// Readiness signal; the host waits on it without a timeout
    fn on_service_ready(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(true);
        rx
    }

    /// Handle one request; respond inline or move the responder into a task
    fn handle_service_request(&self, request: Request, responder: Responder);

    async fn on_server_shutdown(&self) {}

    fn rest_bridge_config(&self) -> Vec<RestBridgeConfig> {
        vec![]
    }

    /// Service-reported health; `None` derives it from the lifecycle state
    async fn health(&self) -> Option<ServiceHealth> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Registered,
    Initializing,
    AwaitingReady,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServiceState::Registered => "registered",
            ServiceState::Initializing => "initializing",
            ServiceState::AwaitingReady => "awaiting-ready",
            ServiceState::Running => "running",
            ServiceState::ShuttingDown => "shutting-down",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

struct ServiceEntry {
    service: Arc<dyn Service>,
    state: RwLock<ServiceState>,
    dispatcher: Mutex<Option<RequestDispatcher>>,
    galactic: Mutex<bool>,
}

impl ServiceEntry {
    fn set_state(&self, state: ServiceState) {
        *self.state.write() = state;
        logger::debug(
            LogTag::Services,
            &format!("{} -> {}", self.service.name(), state),
        );
    }

    fn state(&self) -> ServiceState {
        *self.state.read()
    }
}

/// Drives registered services through their lifecycle
pub struct ServiceHost {
    bus: EventBus,
    entries: Vec<Arc<ServiceEntry>>,
    dispatcher_config: DispatcherConfig,
    rest: RestClient,
    rest_bridge: Arc<RestBridge>,
    broker: Option<BrokerConnection>,
    shutdown: Arc<Notify>,
}

impl ServiceHost {
    pub fn new(bus: EventBus, dispatcher_config: DispatcherConfig) -> Result<Self, String> {
        let rest = RestClient::new(Duration::from_secs(10))?;
        let bridge_timeout = dispatcher_config
            .request_timeout()
            .unwrap_or(Duration::from_secs(30));
        Ok(Self {
            rest_bridge: Arc::new(RestBridge::new(bus.clone(), bridge_timeout)),
            bus,
            entries: Vec::new(),
            dispatcher_config,
            rest,
            broker: None,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Bridge service channels with a broker destination over `connection`
    pub fn with_broker(mut self, connection: BrokerConnection) -> Self {
        self.broker = Some(connection);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn rest_bridge(&self) -> Arc<RestBridge> {
        Arc::clone(&self.rest_bridge)
    }

    /// Shutdown request signal
    ///
    /// The host binary's Ctrl-C handler notifies it; `stop_all` wakes every
    /// task still waiting on it.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Register a service; names and channels must be unique
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<(), String> {
        if let Some(existing) = self.entries.iter().find(|e| {
            e.service.name() == service.name() || e.service.channel() == service.channel()
        }) {
            return Err(format!(
                "Cannot register '{}' on '{}': '{}' already holds that name or channel",
                service.name(),
                service.channel(),
                existing.service.name()
            ));
        }

        logger::info(
            LogTag::Services,
            &format!("Registered {} on '{}'", service.name(), service.channel()),
        );
        self.entries.push(Arc::new(ServiceEntry {
            service,
            state: RwLock::new(ServiceState::Registered),
            dispatcher: Mutex::new(None),
            galactic: Mutex::new(false),
        }));
        Ok(())
    }

    fn ordered(&self) -> Vec<Arc<ServiceEntry>> {
        let mut ordered = self.entries.clone();
        ordered.sort_by_key(|e| e.service.priority());
        ordered
    }

    /// Start every registered service in priority order
    ///
    /// Stops at the first failure; services already running stay running so
    /// the caller can `stop_all`.
    pub async fn start_all(&self) -> Result<(), String> {
        logger::info(LogTag::Services, "Starting all services...");

        for entry in self.ordered() {
            if entry.state() != ServiceState::Registered {
                continue;
            }
            if let Err(e) = self.start_one(&entry).await {
                entry.set_state(ServiceState::Failed);
                logger::error(LogTag::Services, &e);
                return Err(e);
            }
        }

        logger::info(LogTag::Services, "All services started");
        Ok(())
    }

    async fn start_one(&self, entry: &ServiceEntry) -> Result<(), String> {
        let service = &entry.service;
        let name = service.name();
        let channel = service.channel().to_string();

        entry.set_state(ServiceState::Initializing);
        self.bus.create_channel(&channel);
        service
            .init(ServiceCore::new(self.bus.clone(), &channel, self.rest.clone()))
            .await
            .map_err(|e| format!("Service {} failed to initialize: {}", name, e))?;

        entry.set_state(ServiceState::AwaitingReady);
        match service.on_service_ready().await {
            Ok(true) => {}
            Ok(false) => return Err(format!("Service {} reported it is not ready", name)),
            Err(_) => return Err(format!("Service {} dropped its readiness signal", name)),
        }

        let handler_service = Arc::clone(service);
        let handler: RequestHandler = Arc::new(move |request: Request, responder: Responder| {
            handler_service.handle_service_request(request, responder)
        });
        let dispatcher = RequestDispatcher::start(
            &self.bus,
            &channel,
            &service.commands(),
            self.dispatcher_config.request_timeout(),
            handler,
        )
        .map_err(|e| format!("Service {} dispatcher failed: {}", name, e))?;
        *entry.dispatcher.lock() = Some(dispatcher);

        if let (Some(broker), Some(destination)) = (&self.broker, service.broker_destination()) {
            self.bus
                .mark_galactic(&channel, destination, broker)
                .await
                .map_err(|e| format!("Service {} could not bridge '{}': {}", name, channel, e))?;
            *entry.galactic.lock() = true;
        }

        for config in service.rest_bridge_config() {
            self.rest_bridge
                .register(config)
                .map_err(|e| format!("Service {} REST bridge: {}", name, e))?;
        }

        entry.set_state(ServiceState::Running);
        logger::info(
            LogTag::Services,
            &format!("Service started: {} on '{}'", name, channel),
        );
        Ok(())
    }

    /// Stop started services in reverse priority order
    pub async fn stop_all(&self) -> Result<(), String> {
        logger::info(LogTag::Services, "Stopping all services...");
        self.shutdown.notify_waiters();

        let mut ordered = self.ordered();
        ordered.reverse();

        for entry in ordered {
            if matches!(
                entry.state(),
                ServiceState::Registered | ServiceState::Stopped
            ) {
                continue;
            }
            let name = entry.service.name();
            let channel = entry.service.channel().to_string();
            entry.set_state(ServiceState::ShuttingDown);

            let dispatcher = entry.dispatcher.lock().take();
            if let Some(dispatcher) = dispatcher {
                dispatcher.stop();
            }
            entry.service.on_server_shutdown().await;

            self.rest_bridge.unregister_channel(&channel);
            let was_galactic = std::mem::take(&mut *entry.galactic.lock());
            if was_galactic {
                if let Err(e) = self.bus.mark_local(&channel).await {
                    logger::warning(
                        LogTag::Services,
                        &format!("Service {}: unbridging '{}' failed: {}", name, channel, e),
                    );
                }
            }

            entry.set_state(ServiceState::Stopped);
            logger::info(LogTag::Services, &format!("Service stopped: {}", name));
        }

        logger::info(LogTag::Services, "All services stopped");
        Ok(())
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.entries
            .iter()
            .find(|e| e.service.name() == name)
            .map(|e| e.state())
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.ordered().iter().map(|e| e.service.name()).collect()
    }

    /// Get health status
    pub async fn health(&self) -> HashMap<&'static str, ServiceHealth> {
        let mut health = HashMap::new();
        for entry in &self.entries {
            let state = entry.state();
            let reported = if state == ServiceState::Running {
                entry.service.health().await
            } else {
                None
            };
            health.insert(
                entry.service.name(),
                reported.unwrap_or_else(|| ServiceHealth::from_state(state)),
            );
        }
        health
    }
}
