use super::*;
use crate::bridge::{Connector, ConnectionState, InboundSink, MemoryBroker, Transport};
use crate::bus::subscription::SubscriptionInner;
use async_trait::async_trait;
use crate::config::BrokerConfig;
use crate::services::{RequestDispatcher, Responder};
use serde_json::json;
use std::sync::atomic::AtomicUsize;

/// Poll until `check` passes or roughly a second elapses
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Let spawned delivery tasks run without advancing time much
async fn drain() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[derive(Default)]
struct Recorder {
    texts: Mutex<Vec<String>>,
    errors: Mutex<Vec<BusError>>,
}

impl Recorder {
    fn attach(self: &Arc<Self>, subscription: &Subscription) {
        let ok = Arc::clone(self);
        let err = Arc::clone(self);
        subscription.handle(
            move |m| {
                let text = m.payload.as_text().unwrap_or_default().to_string();
                ok.texts.lock().push(text);
            },
            move |e| err.errors.lock().push(e.clone()),
        );
    }

    fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }

    fn errors(&self) -> Vec<BusError> {
        self.errors.lock().clone()
    }
}

fn memory_config() -> BrokerConfig {
    BrokerConfig::default()
}

// ============================================================================
// LOCAL CHANNELS
// ============================================================================

#[tokio::test]
async fn test_stream_subscribers_see_every_message_in_order() {
    let bus = EventBus::default();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    first.attach(&bus.listen_stream("numbers").unwrap());
    second.attach(&bus.listen_stream("numbers").unwrap());

    for n in 0..50 {
        bus.publish("numbers", Payload::text(n.to_string())).unwrap();
    }

    let expected: Vec<String> = (0..50).map(|n| n.to_string()).collect();
    assert!(wait_until(|| first.texts().len() == 50 && second.texts().len() == 50).await);
    assert_eq!(first.texts(), expected);
    assert_eq!(second.texts(), expected);
}

#[tokio::test]
async fn test_once_receives_exactly_one_message() {
    let bus = EventBus::default();
    let recorder = Arc::new(Recorder::default());
    let once = bus.listen_once("jokes").unwrap();
    recorder.attach(&once);

    for n in 0..5 {
        bus.publish("jokes", Payload::text(format!("joke {}", n))).unwrap();
    }
    drain().await;

    assert_eq!(recorder.texts(), vec!["joke 0".to_string()]);
    assert!(recorder.errors().is_empty());
    assert!(once.is_closed());
    assert_eq!(bus.create_channel("jokes").subscriber_count(), 0);
}

#[tokio::test]
async fn test_messages_before_handle_are_queued() {
    let bus = EventBus::default();
    let stream = bus.listen_stream("early").unwrap();
    bus.publish("early", Payload::text("a")).unwrap();
    bus.publish("early", Payload::text("b")).unwrap();
    assert_eq!(stream.pending(), 2);

    let recorder = Arc::new(Recorder::default());
    recorder.attach(&stream);
    assert!(wait_until(|| recorder.texts().len() == 2).await);
    assert_eq!(recorder.texts(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_overflow_reports_slow_consumer_without_blocking() {
    let bus = EventBus::new(BusConfig {
        subscription_buffer: 4,
        ..BusConfig::default()
    });
    let slow = bus.listen_stream("firehose").unwrap();
    let healthy = Arc::new(Recorder::default());
    healthy.attach(&bus.listen_stream("firehose").unwrap());

    for n in 0..10 {
        bus.publish("firehose", Payload::text(n.to_string())).unwrap();
        // Give the attached subscriber's delivery task a turn
        tokio::task::yield_now().await;
    }
    assert_eq!(slow.pending(), 4);

    let recorder = Arc::new(Recorder::default());
    recorder.attach(&slow);
    assert!(wait_until(|| recorder.texts().len() == 4).await);

    assert_eq!(
        recorder.errors(),
        vec![BusError::SlowConsumer {
            channel: "firehose".to_string(),
            dropped: 6
        }]
    );
    assert_eq!(recorder.texts(), vec!["0", "1", "2", "3"]);

    // The other subscriber on the channel is unaffected
    assert!(wait_until(|| healthy.texts().len() == 10).await);
    assert!(healthy.errors().is_empty());
}

#[tokio::test]
async fn test_close_stops_callbacks() {
    let bus = EventBus::default();
    let recorder = Arc::new(Recorder::default());
    let stream = bus.listen_stream("ticks").unwrap();
    recorder.attach(&stream);

    bus.publish("ticks", Payload::text("1")).unwrap();
    assert!(wait_until(|| recorder.texts().len() == 1).await);

    stream.close();
    for _ in 0..5 {
        bus.publish("ticks", Payload::text("more")).unwrap();
    }
    drain().await;
    assert_eq!(recorder.texts(), vec!["1"]);
    assert!(stream.is_closed());
}

#[tokio::test]
async fn test_close_from_inside_callback() {
    let bus = EventBus::default();
    let stream = bus.listen_stream("self-close").unwrap();
    for n in 0..3 {
        bus.publish("self-close", Payload::text(n.to_string())).unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = stream.clone();
    stream.handle(
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            handle.close();
        },
        |_| {},
    );
    drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_destroy_cancels_pending_once() {
    let bus = EventBus::default();
    let recorder = Arc::new(Recorder::default());
    let once = bus.listen_once("doomed").unwrap();
    recorder.attach(&once);

    bus.destroy_channel("doomed").unwrap();
    assert!(wait_until(|| !recorder.errors().is_empty()).await);

    assert_eq!(
        recorder.errors(),
        vec![BusError::Cancelled("doomed".to_string())]
    );
    assert!(recorder.texts().is_empty());
    assert!(!bus.channel_exists("doomed"));
    assert!(matches!(
        bus.destroy_channel("doomed"),
        Err(BusError::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn test_attach_to_destroyed_channel_is_cancelled() {
    let bus = EventBus::default();
    let stale = bus.create_channel("gone");
    bus.destroy_channel("gone").unwrap();

    // A subscribe that resolved the channel just before teardown
    let inner = SubscriptionInner::new(99, "gone", Cardinality::Once, Interest::Responses, 4);
    stale.attach(Arc::clone(&inner));
    let recorder = Arc::new(Recorder::default());
    recorder.attach(&Subscription::from_inner(inner));

    assert!(wait_until(|| !recorder.errors().is_empty()).await);
    assert_eq!(recorder.errors(), vec![BusError::Cancelled("gone".to_string())]);
    assert_eq!(stale.subscriber_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_listen_and_destroy_never_strands_a_subscriber() {
    let bus = EventBus::default();
    for round in 0..200 {
        let name = format!("race-{}", round);
        bus.create_channel(&name);

        let recorder = Arc::new(Recorder::default());
        let listener = {
            let bus = bus.clone();
            let name = name.clone();
            let recorder = Arc::clone(&recorder);
            tokio::spawn(async move {
                let once = bus.listen_once(&name).unwrap();
                recorder.attach(&once);
            })
        };
        let destroyer = {
            let bus = bus.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let _ = bus.destroy_channel(&name);
            })
        };
        listener.await.unwrap();
        destroyer.await.unwrap();

        // Either the subscribe recreated the channel after teardown, or the
        // subscription was cancelled with it
        if !bus.channel_exists(&name) {
            assert!(
                wait_until(|| recorder.errors() == vec![BusError::Cancelled(name.clone())]).await,
                "round {} left a subscriber without its cancellation",
                round
            );
        }
    }
}

#[tokio::test]
async fn test_channel_creation_modes() {
    let bus = EventBus::default();
    let a = bus.create_channel("a");
    let again = bus.create_channel("a");
    assert!(Arc::ptr_eq(&a, &again));
    assert!(matches!(
        bus.create_channel_exclusive("a"),
        Err(BusError::ChannelExists(_))
    ));

    // Default mode auto-creates on publish
    bus.publish("auto", Payload::text("x")).unwrap();
    assert!(bus.channel_exists("auto"));

    let strict = EventBus::new(BusConfig {
        strict_channels: true,
        ..BusConfig::default()
    });
    assert!(matches!(
        strict.publish("missing", Payload::text("x")),
        Err(BusError::ChannelNotFound(_))
    ));
    assert!(strict.listen_stream("missing").is_err());
    strict.create_channel("present");
    assert!(strict.publish("present", Payload::text("x")).is_ok());
}

#[tokio::test]
async fn test_send_error_reaches_response_listeners_only() {
    let bus = EventBus::default();
    let listener = Arc::new(Recorder::default());
    let requests = Arc::new(Recorder::default());
    listener.attach(&bus.listen_stream("svc").unwrap());
    requests.attach(&bus.listen_request_stream("svc").unwrap());

    bus.send_error("svc", BusError::GeneratorFailure("empty".to_string()))
        .unwrap();
    assert!(wait_until(|| listener.errors().len() == 1).await);
    drain().await;
    assert!(requests.errors().is_empty());
}

#[tokio::test]
async fn test_typed_decode_failure_is_local_to_subscriber() {
    let bus = EventBus::default();
    let failures = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));

    let f = Arc::clone(&failures);
    bus.listen_stream("typed").unwrap().handle(
        move |m| {
            if m.decode::<Vec<u32>>().is_err() {
                f.fetch_add(1, Ordering::SeqCst);
            }
        },
        |_| {},
    );
    let s = Arc::clone(&successes);
    bus.listen_stream("typed").unwrap().handle(
        move |m| {
            if m.decode::<serde_json::Value>().is_ok() {
                s.fetch_add(1, Ordering::SeqCst);
            }
        },
        |_| {},
    );

    bus.publish("typed", Payload::json(&json!({"not": "a list"})).unwrap())
        .unwrap();
    assert!(wait_until(|| failures.load(Ordering::SeqCst) == 1
        && successes.load(Ordering::SeqCst) == 1)
    .await);
}

// ============================================================================
// GALACTIC CHANNELS
// ============================================================================

#[tokio::test]
async fn test_galactic_then_local_leaves_channel_unchanged() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    recorder.attach(&bus.listen_stream("words").unwrap());
    let before = bus.create_channel("words").subscriber_count();

    bus.mark_galactic("words", "/topic/words", &connection)
        .await
        .unwrap();
    assert!(bus.is_galactic("words"));
    assert!(broker.has_subscriber("/topic/words"));

    bus.mark_local("words").await.unwrap();
    assert!(!bus.is_galactic("words"));
    assert!(!broker.has_subscriber("/topic/words"));
    assert!(connection.destinations().is_empty());
    assert_eq!(bus.create_channel("words").subscriber_count(), before);

    bus.publish("words", Payload::text("local")).unwrap();
    assert!(wait_until(|| recorder.texts() == vec!["local"]).await);
    assert!(recorder.errors().is_empty());
    assert!(broker.sent().is_empty());

    // Marking local again is a no-op
    bus.mark_local("words").await.unwrap();
}

#[tokio::test]
async fn test_jokes_round_trip_through_broker() {
    let bus = EventBus::default();
    let broker = MemoryBroker::with_credentials("guest", "guest");
    broker.respond_with("/queue/joke-service", |body| {
        let request: Request = serde_json::from_slice(body).ok()?;
        let reply = json!({
            "id": request.id.to_string(),
            "joke": "I used to hate facial hair, but then it grew on me.",
            "status": 200
        });
        serde_json::to_vec(&reply).ok()
    });
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    bus.create_channel("jokes");
    let once = bus.listen_once("jokes").unwrap();
    let payloads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&payloads);
    once.handle(
        move |m| sink.lock().push(m.decode::<serde_json::Value>().unwrap()),
        |e| panic!("unexpected error: {}", e),
    );

    bus.mark_galactic("jokes", "/queue/joke-service", &connection)
        .await
        .unwrap();
    let request = Request::new("get-joke");
    bus.send_request("jokes", &request).unwrap();

    assert!(wait_until(|| payloads.lock().len() == 1).await);
    assert!(once.is_closed());

    // Later frames do not reach the closed once subscription
    broker
        .inject("/queue/joke-service", br#"{"id":"x","joke":"again","status":200}"#.to_vec())
        .await;
    drain().await;

    let payloads = payloads.lock();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["status"], 200);
    assert_eq!(payloads[0]["id"], request.id.to_string());

    let sent = broker.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, "/pub/queue/joke-service");
}

#[tokio::test]
async fn test_galactic_publish_is_forwarded_not_delivered_locally() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    broker.respond_with("/topic/sink", |_| None);
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    recorder.attach(&bus.listen_stream("out").unwrap());
    bus.mark_galactic("out", "/topic/sink", &connection)
        .await
        .unwrap();

    bus.publish("out", Payload::text("hello")).unwrap();
    assert!(wait_until(|| broker.sent().len() == 1).await);
    drain().await;
    assert!(recorder.texts().is_empty());
}

#[tokio::test]
async fn test_mapping_conflicts() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    bus.mark_galactic("a", "/x", &connection).await.unwrap();
    // Same mapping again is a no-op
    bus.mark_galactic("a", "/x", &connection).await.unwrap();

    assert!(matches!(
        bus.mark_galactic("a", "/y", &connection).await,
        Err(BusError::MappingConflict { .. })
    ));
    assert!(matches!(
        bus.mark_galactic("b", "/x", &connection).await,
        Err(BusError::MappingConflict { .. })
    ));
    assert_eq!(connection.destinations(), vec!["/x".to_string()]);
    assert!(!bus.is_galactic("b"));
}

#[tokio::test]
async fn test_mark_local_delivers_frames_accepted_before_unmap() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    recorder.attach(&bus.listen_stream("inbound").unwrap());
    bus.mark_galactic("inbound", "/topic/in", &connection)
        .await
        .unwrap();

    for n in 0..20 {
        broker.inject("/topic/in", n.to_string().into_bytes()).await;
    }
    bus.mark_local("inbound").await.unwrap();

    assert!(wait_until(|| recorder.texts().len() == 20).await);
    let expected: Vec<String> = (0..20).map(|n| n.to_string()).collect();
    assert_eq!(recorder.texts(), expected);
}

#[tokio::test]
async fn test_mark_local_flushes_queued_outbound() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    broker.respond_with("/topic/out", |_| None);
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    bus.mark_galactic("out", "/topic/out", &connection)
        .await
        .unwrap();
    for n in 0..10 {
        bus.publish("out", Payload::text(n.to_string())).unwrap();
    }
    bus.mark_local("out").await.unwrap();
    assert_eq!(broker.sent().len(), 10);
}

#[tokio::test]
async fn test_disconnect_notifies_each_subscriber_once() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    let stream = Arc::new(Recorder::default());
    let requests = Arc::new(Recorder::default());
    let other = Arc::new(Recorder::default());
    let local = Arc::new(Recorder::default());
    stream.attach(&bus.listen_stream("one").unwrap());
    requests.attach(&bus.listen_request_stream("one").unwrap());
    other.attach(&bus.listen_stream("two").unwrap());
    local.attach(&bus.listen_stream("local-only").unwrap());

    bus.mark_galactic("one", "/topic/one", &connection)
        .await
        .unwrap();
    bus.mark_galactic("two", "/topic/two", &connection)
        .await
        .unwrap();

    bus.disconnect_broker(connection.id()).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    assert!(wait_until(|| stream.errors().len() == 1
        && requests.errors().len() == 1
        && other.errors().len() == 1)
    .await);
    drain().await;
    for recorder in [&stream, &requests, &other] {
        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], BusError::ConnectionLost { .. }));
    }
    assert!(local.errors().is_empty());

    // Channels revert to local and keep working
    assert!(!bus.is_galactic("one"));
    bus.publish("one", Payload::text("after")).unwrap();
    assert!(wait_until(|| stream.texts() == vec!["after"]).await);

    // A second disconnect is harmless
    connection.disconnect().await.unwrap();
    drain().await;
    assert_eq!(stream.errors().len(), 1);
}

/// Records whether channels were still galactic when the transport closed
struct OrderingTransport {
    bus: EventBus,
    galactic_at_close: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl Transport for OrderingTransport {
    fn endpoint(&self) -> String {
        "ordering://test".to_string()
    }

    async fn subscribe(&self, _destination: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn unsubscribe(&self, _destination: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn send(
        &self,
        _destination: &str,
        _body: Vec<u8>,
        _content_type: ContentType,
    ) -> Result<(), BusError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        *self.galactic_at_close.lock() = Some(self.bus.is_galactic("ordered"));
        Ok(())
    }
}

struct OrderingConnector {
    bus: EventBus,
    galactic_at_close: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl Connector for OrderingConnector {
    async fn connect(
        &self,
        _config: &BrokerConfig,
        _inbound: InboundSink,
    ) -> Result<Arc<dyn Transport>, BusError> {
        Ok(Arc::new(OrderingTransport {
            bus: self.bus.clone(),
            galactic_at_close: Arc::clone(&self.galactic_at_close),
        }))
    }
}

#[tokio::test]
async fn test_disconnect_reverts_mappings_before_closing_transport() {
    let bus = EventBus::default();
    let galactic_at_close = Arc::new(Mutex::new(None));
    let connector = OrderingConnector {
        bus: bus.clone(),
        galactic_at_close: Arc::clone(&galactic_at_close),
    };
    let connection = bus.connect_broker(&memory_config(), &connector).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    recorder.attach(&bus.listen_stream("ordered").unwrap());
    bus.mark_galactic("ordered", "/topic/ordered", &connection)
        .await
        .unwrap();

    connection.disconnect().await.unwrap();
    assert_eq!(*galactic_at_close.lock(), Some(false));
    assert!(wait_until(|| recorder.errors().len() == 1).await);
    assert!(matches!(recorder.errors()[0], BusError::ConnectionLost { .. }));
}

#[tokio::test]
async fn test_remote_loss_fails_connection() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let once = bus.listen_once("words").unwrap();
    recorder.attach(&once);
    bus.mark_galactic("words", "/topic/words", &connection)
        .await
        .unwrap();

    broker.sever("server restart").await;
    assert!(wait_until(|| recorder.errors().len() == 1).await);
    assert!(matches!(
        &recorder.errors()[0],
        BusError::ConnectionLost { reason, .. } if reason == "server restart"
    ));
    assert!(once.is_closed());
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(bus
        .mark_galactic("words", "/topic/words", &connection)
        .await
        .is_err());
}

#[tokio::test]
async fn test_failed_connect_registers_nothing() {
    let bus = EventBus::default();
    let broker = MemoryBroker::with_credentials("guest", "guest");
    let mut config = memory_config();
    config.username = "intruder".to_string();

    let err = bus.connect_broker(&config, &broker).await.unwrap_err();
    assert!(matches!(err, BusError::ConnectionError { .. }));
    assert!(bus.connections().is_empty());
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_destroying_galactic_channel_releases_mapping() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    bus.mark_galactic("temp", "/topic/temp", &connection)
        .await
        .unwrap();
    bus.destroy_channel("temp").unwrap();
    assert!(wait_until(|| connection.destinations().is_empty()).await);
    assert!(wait_until(|| !broker.has_subscriber("/topic/temp")).await);
}

#[tokio::test]
async fn test_request_through_broker_loopback() {
    let bus = EventBus::default();
    let broker = MemoryBroker::new();
    let connection = bus.connect_broker(&memory_config(), &broker).await.unwrap();

    let _dispatcher = RequestDispatcher::start(
        &bus,
        "echo-service",
        &["echo"],
        None,
        Arc::new(|req: Request, responder: Responder| {
            responder.ok(&req.payload);
        }),
    )
    .unwrap();
    bus.mark_galactic("echo-service", "/queue/echo", &connection)
        .await
        .unwrap();

    let request = Request::new("echo").with_payload(&json!({"n": 7})).unwrap();
    let response = bus
        .request("echo-service", request.clone(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response.id, request.id);
    assert_eq!(response.payload, json!({"n": 7}));

    bus.disconnect_all().await.unwrap();
}
