use super::implementations::random_word_service::{random_word, FALLBACK_WORDS};
use super::implementations::{Joke, JokeService, JokeSource, RandomWordService, WordSource};
use super::*;
use crate::bridge::MemoryBroker;
use crate::bus::Response;
use crate::config::{BrokerConfig, BusConfig, JokeServiceConfig, RandomWordServiceConfig};
use crate::errors::BusError;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn word_of(message: &crate::bus::Message) -> String {
    message
        .decode::<Response>()
        .unwrap()
        .decode_payload::<String>()
        .unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn host() -> ServiceHost {
    ServiceHost::new(EventBus::new(BusConfig::default()), DispatcherConfig::default()).unwrap()
}

// ============================================================================
// SCHEDULED PRODUCER
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_producer_ticks_words_and_stops() {
    let bus = EventBus::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.listen_stream("words").unwrap().handle(
        move |m| sink.lock().push(word_of(m)),
        |e| panic!("unexpected error: {}", e),
    );

    let words: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let list = words.clone();
    let producer = ScheduledProducer::new(bus.clone(), "words");
    producer.start(Duration::from_secs(1), move || random_word(&list));

    tokio::time::sleep(Duration::from_millis(5500)).await;
    producer.stop();
    let observed = seen.lock().clone();
    assert_eq!(observed.len(), 5);
    assert!(observed.iter().all(|w| words.contains(w)));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(seen.lock().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_empty_word_list_only_reports_errors() {
    let bus = EventBus::default();
    let values = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let v = Arc::clone(&values);
    let e = Arc::clone(&errors);
    bus.listen_stream("words").unwrap().handle(
        move |_| {
            v.fetch_add(1, Ordering::SeqCst);
        },
        move |err| e.lock().push(err.clone()),
    );

    let producer = ScheduledProducer::new(bus.clone(), "words");
    producer.start(Duration::from_secs(1), || random_word(&[]));

    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert!(producer.is_running());
    assert_eq!(values.load(Ordering::SeqCst), 0);
    let errors = errors.lock();
    assert_eq!(errors.len(), 5);
    assert!(errors
        .iter()
        .all(|e| matches!(e, BusError::GeneratorFailure(_))));
}

// ============================================================================
// SERVICE HOST LIFECYCLE
// ============================================================================

struct EchoService {
    ready: bool,
    fail_init: bool,
    shutdown_called: AtomicBool,
    handled: AtomicUsize,
}

impl EchoService {
    fn new() -> Self {
        Self {
            ready: true,
            fail_init: false,
            shutdown_called: AtomicBool::new(false),
            handled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Service for EchoService {
    fn name(&self) -> &'static str {
        "echo_service"
    }

    fn channel(&self) -> &str {
        "echo"
    }

    fn commands(&self) -> Vec<&'static str> {
        vec!["echo"]
    }

    async fn init(&self, core: ServiceCore) -> Result<(), String> {
        assert_eq!(core.channel(), "echo");
        if self.fail_init {
            return Err("no config".to_string());
        }
        Ok(())
    }

    fn on_service_ready(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(self.ready);
        rx
    }

    fn handle_service_request(&self, request: Request, responder: Responder) {
        self.handled.fetch_add(1, Ordering::SeqCst);
        responder.ok(&request.payload);
    }

    async fn on_server_shutdown(&self) {
        self.shutdown_called.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_lifecycle_start_request_stop() {
    let mut host = host();
    let service = Arc::new(EchoService::new());
    host.register(service.clone()).unwrap();
    assert_eq!(host.state("echo_service"), Some(ServiceState::Registered));
    assert_eq!(
        host.health().await.get("echo_service"),
        Some(&ServiceHealth::Starting)
    );

    host.start_all().await.unwrap();
    assert_eq!(host.state("echo_service"), Some(ServiceState::Running));
    assert!(host.health().await["echo_service"].is_healthy());

    let response = host
        .bus()
        .request(
            "echo",
            Request::new("echo").with_payload(&json!([1, 2])).unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(response.payload, json!([1, 2]));

    let unknown = host
        .bus()
        .request("echo", Request::new("shout"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(unknown.error);
    assert_eq!(unknown.error_code, 404);
    assert_eq!(service.handled.load(Ordering::SeqCst), 1);

    host.stop_all().await.unwrap();
    assert_eq!(host.state("echo_service"), Some(ServiceState::Stopped));
    assert!(service.shutdown_called.load(Ordering::SeqCst));

    let err = host
        .bus()
        .request("echo", Request::new("echo"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RequestTimeout(_)));
}

#[tokio::test]
async fn test_shutdown_signal_wakes_on_request_and_on_stop() {
    let mut host = host();
    host.register(Arc::new(EchoService::new())).unwrap();
    host.start_all().await.unwrap();

    // A stored permit from a signal handler is seen by a later waiter
    let signal = host.shutdown_signal();
    signal.notify_one();
    tokio::time::timeout(Duration::from_secs(1), host.shutdown_signal().notified())
        .await
        .unwrap();

    let waiter = {
        let signal = host.shutdown_signal();
        tokio::spawn(async move { signal.notified().await })
    };
    tokio::task::yield_now().await;
    host.stop_all().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let mut host = host();
    host.register(Arc::new(EchoService::new())).unwrap();
    assert!(host.register(Arc::new(EchoService::new())).is_err());
    assert_eq!(host.service_names(), vec!["echo_service"]);
}

#[tokio::test]
async fn test_not_ready_or_failed_init_aborts_startup() {
    let mut not_ready = host();
    not_ready
        .register(Arc::new(EchoService {
            ready: false,
            ..EchoService::new()
        }))
        .unwrap();
    assert!(not_ready.start_all().await.is_err());
    assert_eq!(not_ready.state("echo_service"), Some(ServiceState::Failed));

    let mut bad_init = host();
    bad_init
        .register(Arc::new(EchoService {
            fail_init: true,
            ..EchoService::new()
        }))
        .unwrap();
    let err = bad_init.start_all().await.unwrap_err();
    assert!(err.contains("no config"));
}

// ============================================================================
// DEMO SERVICES
// ============================================================================

struct FixedJokes {
    fail: bool,
}

#[async_trait]
impl JokeSource for FixedJokes {
    async fn fetch_joke(&self) -> Result<Joke, BusError> {
        if self.fail {
            return Err(BusError::RestFailure {
                status: 503,
                message: "joke API down".to_string(),
            });
        }
        Ok(Joke {
            id: "R7UfaahVfFd".to_string(),
            joke: "My dog used to chase people on a bike a lot. It got so bad I had to take his bike away.".to_string(),
            status: 200,
        })
    }
}

#[tokio::test]
async fn test_joke_service_over_rest_bridge() {
    let mut host = host();
    host.register(Arc::new(JokeService::with_source(
        JokeServiceConfig::default(),
        Arc::new(FixedJokes { fail: false }),
    )))
    .unwrap();
    host.start_all().await.unwrap();

    let reply = host
        .rest_bridge()
        .handle(RestCall::new("GET", "/rest/joke"))
        .await;
    assert_eq!(reply.status, 200);
    let joke: Joke = serde_json::from_slice(&reply.body).unwrap();
    assert_eq!(joke.status, 200);

    host.stop_all().await.unwrap();
    assert!(host.rest_bridge().routes().is_empty());
}

#[tokio::test]
async fn test_joke_source_failure_is_error_response() {
    let mut host = host();
    host.register(Arc::new(JokeService::with_source(
        JokeServiceConfig::default(),
        Arc::new(FixedJokes { fail: true }),
    )))
    .unwrap();
    host.start_all().await.unwrap();

    let response: Response = host
        .bus()
        .request("joke-service", Request::new("get-joke"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(response.error);
    assert_eq!(response.error_code, 502);
    assert_eq!(
        response.error_message.as_deref(),
        Some("Get Joke API Call Failed")
    );
    assert!(host.health().await["joke_service"].is_degraded());

    let reply = host
        .rest_bridge()
        .handle(RestCall::new("GET", "/rest/joke"))
        .await;
    assert_eq!(reply.status, 502);
}

struct BrokenWords;

#[async_trait]
impl WordSource for BrokenWords {
    async fn fetch_words(&self, _count: usize) -> Result<Vec<String>, BusError> {
        Err(BusError::RestFailure {
            status: 0,
            message: "unreachable".to_string(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_random_word_service_falls_back_and_stops() {
    let mut host = host();
    let service = Arc::new(RandomWordService::with_source(
        RandomWordServiceConfig::default(),
        Arc::new(BrokenWords),
    ));
    host.register(service.clone()).unwrap();
    host.start_all().await.unwrap();
    assert!(service.is_using_fallback());
    assert_eq!(service.words().len(), FALLBACK_WORDS.len());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let stream = host.bus().listen_stream("random-word").unwrap();
    stream.handle(
        move |m| sink.lock().push(word_of(m)),
        |_| {},
    );

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(seen.lock().len() >= 3);
    assert!(seen
        .lock()
        .iter()
        .all(|w| FALLBACK_WORDS.contains(&w.as_str())));
    assert!(host.health().await["random_word_service"].is_degraded());

    host.stop_all().await.unwrap();
    let count = seen.lock().len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(seen.lock().len(), count);
    stream.close();
}

#[tokio::test]
async fn test_host_bridges_services_to_broker() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig::default();

    let server_bus = EventBus::default();
    let connection = server_bus.connect_broker(&config, &broker).await.unwrap();
    let mut host = ServiceHost::new(server_bus.clone(), DispatcherConfig::default())
        .unwrap()
        .with_broker(connection);
    host.register(Arc::new(JokeService::with_source(
        JokeServiceConfig::default(),
        Arc::new(FixedJokes { fail: false }),
    )))
    .unwrap();
    host.start_all().await.unwrap();
    assert!(server_bus.is_galactic("joke-service"));

    // A separate client bus reaches the service through the broker
    let client_bus = EventBus::default();
    let client = client_bus.connect_broker(&config, &broker).await.unwrap();
    client_bus
        .mark_galactic("jokes", "/queue/joke-service", &client)
        .await
        .unwrap();
    let response = client_bus
        .request("jokes", Request::new("get-joke"), Duration::from_secs(2))
        .await
        .unwrap();
    let joke: Joke = response.decode_payload().unwrap();
    assert_eq!(joke.id, "R7UfaahVfFd");

    host.stop_all().await.unwrap();
    assert!(!server_bus.is_galactic("joke-service"));
    client_bus.disconnect_all().await.unwrap();
    server_bus.disconnect_all().await.unwrap();
    assert!(wait_until(|| broker.session_count() == 0).await);
}

#[test]
fn test_word_payload_is_response_envelope() {
    let payload = random_word(&["ember".to_string()]).unwrap();
    let value: serde_json::Value = payload.decode().unwrap();
    assert!(value["id"].is_string());
    assert_eq!(value["payload"], json!("ember"));

    let response: Response = payload.decode().unwrap();
    assert!(!response.error);
    assert_eq!(response.decode_payload::<String>().unwrap(), "ember");
}
