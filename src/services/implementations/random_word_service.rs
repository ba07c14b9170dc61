use crate::bus::{Payload, Request, Response};
use crate::config::RandomWordServiceConfig;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use crate::services::rest::{RestClient, RestServiceRequest};
use crate::services::{Responder, ScheduledProducer, Service, ServiceCore, ServiceHealth};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

pub const RANDOM_WORD_CHANNEL: &str = "random-word";
pub const RANDOM_WORD_DESTINATION: &str = "/topic/random-word";

/// Used when the word source is unreachable
pub const FALLBACK_WORDS: [&str; 5] = ["magnum", "fox", "kitty", "cotton", "ember"];

#[async_trait]
pub trait WordSource: Send + Sync {
    async fn fetch_words(&self, count: usize) -> Result<Vec<String>, BusError>;
}

/// random-word-api compatible HTTP source
pub struct HttpWordSource {
    client: RestClient,
    api_url: String,
}

impl HttpWordSource {
    pub fn new(client: RestClient, api_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.to_string(),
        }
    }
}

#[async_trait]
impl WordSource for HttpWordSource {
    async fn fetch_words(&self, count: usize) -> Result<Vec<String>, BusError> {
        self.client
            .execute(&RestServiceRequest::get(&self.api_url).with_query("number", count))
            .await
    }
}

/// Pick one word and wrap it in a Response envelope with a fresh id
///
/// An empty list is a generator failure.
pub fn random_word(words: &[String]) -> Result<Payload, BusError> {
    let word = words
        .choose(&mut rand::thread_rng())
        .ok_or_else(|| BusError::GeneratorFailure("word list is empty".to_string()))?;
    Payload::json(&Response::ok(Uuid::new_v4(), word)?)
}

struct WordState {
    words: Arc<RwLock<Vec<String>>>,
    producer: Mutex<Option<ScheduledProducer>>,
    using_fallback: AtomicBool,
}

/// Streams one random word per tick on its channel
pub struct RandomWordService {
    config: RandomWordServiceConfig,
    source: OnceCell<Arc<dyn WordSource>>,
    core: OnceCell<ServiceCore>,
    state: Arc<WordState>,
}

impl RandomWordService {
    pub fn new(config: RandomWordServiceConfig) -> Self {
        Self {
            config,
            source: OnceCell::new(),
            core: OnceCell::new(),
            state: Arc::new(WordState {
                words: Arc::new(RwLock::new(Vec::new())),
                producer: Mutex::new(None),
                using_fallback: AtomicBool::new(false),
            }),
        }
    }

    /// Use a custom source instead of the HTTP API
    pub fn with_source(config: RandomWordServiceConfig, source: Arc<dyn WordSource>) -> Self {
        let service = Self::new(config);
        let _ = service.source.set(source);
        service
    }

    pub fn words(&self) -> Vec<String> {
        self.state.words.read().clone()
    }

    pub fn is_using_fallback(&self) -> bool {
        self.state.using_fallback.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Service for RandomWordService {
    fn name(&self) -> &'static str {
        "random_word_service"
    }

    fn channel(&self) -> &str {
        RANDOM_WORD_CHANNEL
    }

    fn priority(&self) -> i32 {
        110
    }

    fn broker_destination(&self) -> Option<&str> {
        Some(RANDOM_WORD_DESTINATION)
    }

    async fn init(&self, core: ServiceCore) -> Result<(), String> {
        if self.source.get().is_none() {
            let source = HttpWordSource::new(core.rest_client().clone(), &self.config.api_url);
            let _ = self.source.set(Arc::new(source));
        }
        self.core
            .set(core)
            .map_err(|_| "random_word_service initialized twice".to_string())
    }

    /// Loads the word list, then starts ticking and reports ready
    fn on_service_ready(&self) -> oneshot::Receiver<bool> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (Some(source), Some(core)) = (self.source.get().cloned(), self.core.get().cloned())
        else {
            let _ = ready_tx.send(false);
            return ready_rx;
        };

        let state = Arc::clone(&self.state);
        let count = self.config.word_count;
        let period = Duration::from_millis(self.config.tick_ms);

        tokio::spawn(async move {
            let words = match source.fetch_words(count).await {
                Ok(words) if !words.is_empty() => {
                    logger::info(
                        LogTag::Services,
                        &format!("random_word_service loaded {} words", words.len()),
                    );
                    words
                }
                outcome => {
                    let reason = match outcome {
                        Err(e) => e.to_string(),
                        Ok(_) => "source returned no words".to_string(),
                    };
                    logger::warning(
                        LogTag::Services,
                        &format!("Word fetch failed ({}), using fallback list", reason),
                    );
                    state.using_fallback.store(true, Ordering::Release);
                    FALLBACK_WORDS.iter().map(|w| w.to_string()).collect()
                }
            };
            *state.words.write() = words;

            let producer = core.scheduled_producer();
            let words = Arc::clone(&state.words);
            producer.start(period, move || random_word(&words.read()));
            *state.producer.lock() = Some(producer);

            let _ = ready_tx.send(true);
        });
        ready_rx
    }

    fn handle_service_request(&self, request: Request, responder: Responder) {
        responder.error(BusError::UnknownCommand(request.request));
    }

    async fn on_server_shutdown(&self) {
        if let Some(producer) = self.state.producer.lock().take() {
            producer.stop();
        }
    }

    async fn health(&self) -> Option<ServiceHealth> {
        if self.is_using_fallback() {
            Some(ServiceHealth::Degraded("serving fallback word list".to_string()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_word_from_list() {
        let words = vec!["a".to_string(), "b".to_string()];
        for _ in 0..20 {
            let response: Response = random_word(&words).unwrap().decode().unwrap();
            assert!(!response.error);
            let word: String = response.decode_payload().unwrap();
            assert!(words.contains(&word));
        }
    }

    #[test]
    fn test_single_word_list_is_selectable() {
        let words = vec!["only".to_string()];
        let response: Response = random_word(&words).unwrap().decode().unwrap();
        assert_eq!(response.decode_payload::<String>().unwrap(), "only");
    }

    #[test]
    fn test_each_word_has_its_own_id() {
        let words = vec!["ember".to_string()];
        let first: Response = random_word(&words).unwrap().decode().unwrap();
        let second: Response = random_word(&words).unwrap().decode().unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_empty_list_is_generator_failure() {
        let err = random_word(&[]).unwrap_err();
        assert!(matches!(err, BusError::GeneratorFailure(_)));
    }
}
