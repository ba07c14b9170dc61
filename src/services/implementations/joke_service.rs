use crate::bus::Request;
use crate::config::JokeServiceConfig;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use crate::services::rest::{RestClient, RestServiceRequest};
use crate::services::{Responder, RestBridgeConfig, Service, ServiceCore, ServiceHealth};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const JOKE_SERVICE_CHANNEL: &str = "joke-service";
pub const JOKE_SERVICE_DESTINATION: &str = "/queue/joke-service";
pub const GET_JOKE: &str = "get-joke";

/// Joke as returned by the joke API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Joke {
    pub id: String,
    pub joke: String,
    pub status: u16,
}

#[async_trait]
pub trait JokeSource: Send + Sync {
    async fn fetch_joke(&self) -> Result<Joke, BusError>;
}

/// icanhazdadjoke-compatible HTTP source
pub struct HttpJokeSource {
    client: RestClient,
    api_url: String,
}

impl HttpJokeSource {
    pub fn new(client: RestClient, api_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.to_string(),
        }
    }
}

#[async_trait]
impl JokeSource for HttpJokeSource {
    async fn fetch_joke(&self) -> Result<Joke, BusError> {
        self.client
            .execute(&RestServiceRequest::get(&self.api_url).accept_json())
            .await
    }
}

/// Answers `get-joke` with a joke from its source
pub struct JokeService {
    config: JokeServiceConfig,
    source: OnceCell<Arc<dyn JokeSource>>,
    last_failure: Arc<Mutex<Option<String>>>,
}

impl JokeService {
    pub fn new(config: JokeServiceConfig) -> Self {
        Self {
            config,
            source: OnceCell::new(),
            last_failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Use a custom source instead of the HTTP API
    pub fn with_source(config: JokeServiceConfig, source: Arc<dyn JokeSource>) -> Self {
        let service = Self::new(config);
        let _ = service.source.set(source);
        service
    }
}

#[async_trait]
impl Service for JokeService {
    fn name(&self) -> &'static str {
        "joke_service"
    }

    fn channel(&self) -> &str {
        JOKE_SERVICE_CHANNEL
    }

    fn priority(&self) -> i32 {
        100
    }

    fn commands(&self) -> Vec<&'static str> {
        vec![GET_JOKE]
    }

    fn broker_destination(&self) -> Option<&str> {
        Some(JOKE_SERVICE_DESTINATION)
    }

    async fn init(&self, core: ServiceCore) -> Result<(), String> {
        if self.source.get().is_none() {
            let source = HttpJokeSource::new(core.rest_client().clone(), &self.config.api_url);
            let _ = self.source.set(Arc::new(source));
        }
        logger::debug(
            LogTag::Services,
            &format!("joke_service using {}", self.config.api_url),
        );
        Ok(())
    }

    fn handle_service_request(&self, request: Request, responder: Responder) {
        let Some(source) = self.source.get().cloned() else {
            responder.error(BusError::HandlerFailure(
                "joke source not initialized".to_string(),
            ));
            return;
        };
        let last_failure = Arc::clone(&self.last_failure);

        logger::debug(
            LogTag::Services,
            &format!("joke_service: {} ({})", request.request, request.id),
        );
        tokio::spawn(async move {
            match source.fetch_joke().await {
                Ok(joke) => {
                    last_failure.lock().take();
                    responder.ok(&joke);
                }
                Err(e) => {
                    logger::warning(LogTag::Services, &format!("Get Joke API Call Failed: {}", e));
                    *last_failure.lock() = Some(e.to_string());
                    responder.fail(
                        e.status_code(),
                        "Get Joke API Call Failed",
                        Some(serde_json::json!({ "error": e.to_string() })),
                    );
                }
            }
        });
    }

    fn rest_bridge_config(&self) -> Vec<RestBridgeConfig> {
        vec![RestBridgeConfig::command(JOKE_SERVICE_CHANNEL, "GET", "/rest/joke", GET_JOKE)
            .with_head()
            .with_options()]
    }

    async fn health(&self) -> Option<ServiceHealth> {
        self.last_failure
            .lock()
            .clone()
            .map(|reason| ServiceHealth::Degraded(format!("last fetch failed: {}", reason)))
    }
}
