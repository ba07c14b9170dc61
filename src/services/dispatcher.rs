/// Request/response dispatcher for one service channel
///
/// Per request: received -> dispatched -> completed | failed | timed-out.
/// Every request gets exactly one Response on the originating channel. The
/// `Responder` handed to the handler is consumed by its first use; dropping
/// it unused settles the request as a handler failure. With a deadline
/// configured, whichever of timer and handler settles first wins and the
/// other outcome is discarded.
use crate::bus::{EventBus, Message, Request, Response, Subscription};
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Request handler; may respond inline or move the responder into a task
pub type RequestHandler = Arc<dyn Fn(Request, Responder) + Send + Sync>;

type Pending = Arc<Mutex<HashMap<Uuid, Instant>>>;

struct Ticket {
    id: Uuid,
    command: String,
    channel: String,
    bus: EventBus,
    settled: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    pending: Pending,
}

impl Ticket {
    /// Publish the terminal Response; false if the request was already settled
    fn settle(&self, response: Response) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            logger::debug(
                LogTag::Dispatcher,
                &format!(
                    "'{}' {} ({}): late outcome discarded",
                    self.channel, self.id, self.command
                ),
            );
            return false;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        if let Err(e) = self.bus.send_response(&self.channel, &response) {
            logger::error(
                LogTag::Dispatcher,
                &format!("'{}' {}: response not published: {}", self.channel, self.id, e),
            );
        }

        let started = self.pending.lock().remove(&self.id);
        if logger::is_debug_enabled(LogTag::Dispatcher) {
            let elapsed = started.map(|s| s.elapsed().as_millis()).unwrap_or_default();
            logger::debug(
                LogTag::Dispatcher,
                &format!(
                    "'{}' {} ({}) settled {} in {}ms",
                    self.channel,
                    self.id,
                    self.command,
                    if response.error { "with error" } else { "ok" },
                    elapsed
                ),
            );
        }
        true
    }
}

/// One-shot completion handle for a dispatched request
pub struct Responder {
    ticket: Option<Arc<Ticket>>,
}

impl Responder {
    pub fn id(&self) -> Uuid {
        self.ticket.as_ref().map(|t| t.id).unwrap_or_default()
    }

    pub fn command(&self) -> &str {
        self.ticket.as_ref().map(|t| t.command.as_str()).unwrap_or("")
    }

    /// Whether a timeout already settled this request
    pub fn is_settled(&self) -> bool {
        self.ticket
            .as_ref()
            .map(|t| t.settled.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    fn finish(mut self, build: impl FnOnce(Uuid) -> Response) -> bool {
        match self.ticket.take() {
            Some(ticket) => {
                let response = build(ticket.id);
                ticket.settle(response)
            }
            None => false,
        }
    }

    /// Complete with a success payload
    pub fn ok<T: Serialize>(self, payload: &T) -> bool {
        self.finish(|id| {
            Response::ok(id, payload).unwrap_or_else(|e| Response::from_error(id, &e))
        })
    }

    /// Complete with an error mapped through `BusError::status_code`
    pub fn error(self, err: BusError) -> bool {
        self.finish(|id| Response::from_error(id, &err))
    }

    /// Complete with an explicit error code and optional payload
    pub fn fail(
        self,
        code: i32,
        message: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> bool {
        let message = message.into();
        self.finish(|id| Response::failure(id, code, message, payload))
    }

    /// Complete with a prepared Response; its id is forced to the request's
    pub fn respond(self, mut response: Response) -> bool {
        self.finish(|id| {
            response.id = id;
            response
        })
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            let err = BusError::HandlerFailure(format!(
                "'{}' handler returned without responding",
                ticket.command
            ));
            ticket.settle(Response::from_error(ticket.id, &err));
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id())
            .field("command", &self.command())
            .finish()
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct RequestDispatcher {
    channel: String,
    subscription: Subscription,
    pending: Pending,
}

struct DispatchContext {
    bus: EventBus,
    channel: String,
    commands: HashSet<String>,
    timeout: Option<Duration>,
    handler: RequestHandler,
    pending: Pending,
}

impl DispatchContext {
    fn on_message(&self, message: &Message) {
        let request = match message.decode::<Request>() {
            Ok(request) => request,
            Err(e) => {
                self.reject_malformed(message, e);
                return;
            }
        };

        let responder = self.open_ticket(&request);

        if !self.commands.contains(&request.request) {
            logger::debug(
                LogTag::Dispatcher,
                &format!("'{}': unknown command '{}'", self.channel, request.request),
            );
            responder.error(BusError::UnknownCommand(request.request));
            return;
        }

        let handler = Arc::clone(&self.handler);
        let command = request.request.clone();
        if catch_unwind(AssertUnwindSafe(move || handler(request, responder))).is_err() {
            // The responder was dropped during unwinding and settled the request
            logger::error(
                LogTag::Dispatcher,
                &format!("'{}': handler for '{}' panicked", self.channel, command),
            );
        }
    }

    fn open_ticket(&self, request: &Request) -> Responder {
        self.pending.lock().insert(request.id, Instant::now());

        let ticket = Arc::new(Ticket {
            id: request.id,
            command: request.request.clone(),
            channel: self.channel.clone(),
            bus: self.bus.clone(),
            settled: AtomicBool::new(false),
            timer: Mutex::new(None),
            pending: Arc::clone(&self.pending),
        });

        if let Some(deadline) = self.timeout {
            let timed = Arc::clone(&ticket);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let err = BusError::RequestTimeout(timed.id.to_string());
                if timed.settle(Response::from_error(timed.id, &err)) {
                    logger::warning(
                        LogTag::Dispatcher,
                        &format!(
                            "'{}' {} ({}) timed out after {}ms",
                            timed.channel,
                            timed.id,
                            timed.command,
                            deadline.as_millis()
                        ),
                    );
                }
            });
            *ticket.timer.lock() = Some(timer);
        }

        Responder {
            ticket: Some(ticket),
        }
    }

    /// Answer a request that could not be decoded, if it carries an id
    fn reject_malformed(&self, message: &Message, err: BusError) {
        let id = message
            .decode::<serde_json::Value>()
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
            .and_then(|id| Uuid::parse_str(&id).ok());

        logger::warning(
            LogTag::Dispatcher,
            &format!("'{}': malformed request: {}", self.channel, err),
        );
        if let Some(id) = id {
            if let Err(e) = self
                .bus
                .send_response(&self.channel, &Response::from_error(id, &err))
            {
                logger::error(
                    LogTag::Dispatcher,
                    &format!("'{}': error response not published: {}", self.channel, e),
                );
            }
        }
    }
}

impl RequestDispatcher {
    /// Start dispatching requests published on `channel`
    ///
    /// Requests whose command is not in `commands` are answered with
    /// `UnknownCommand` without reaching the handler.
    pub fn start(
        bus: &EventBus,
        channel: &str,
        commands: &[&str],
        timeout: Option<Duration>,
        handler: RequestHandler,
    ) -> Result<Self, BusError> {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let context = Arc::new(DispatchContext {
            bus: bus.clone(),
            channel: channel.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            timeout,
            handler,
            pending: Arc::clone(&pending),
        });

        let subscription = bus.listen_request_stream(channel)?;
        let error_channel = channel.to_string();
        subscription.handle(
            move |message| context.on_message(message),
            move |err| {
                logger::warning(
                    LogTag::Dispatcher,
                    &format!("'{}': request stream error: {}", error_channel, err),
                );
            },
        );

        logger::debug(
            LogTag::Dispatcher,
            &format!("Dispatcher started on '{}' ({:?})", channel, commands),
        );
        Ok(Self {
            channel: channel.to_string(),
            subscription,
            pending,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Requests dispatched and not yet settled
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop accepting requests; in-flight requests still settle
    pub fn stop(&self) {
        self.subscription.close();
        logger::debug(
            LogTag::Dispatcher,
            &format!("Dispatcher on '{}' stopped", self.channel),
        );
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.subscription.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Direction;
    use crate::config::BusConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn collect_responses(bus: &EventBus, channel: &str) -> Arc<Mutex<Vec<Response>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.listen_stream(channel).unwrap().handle(
            move |m: &Message| {
                assert_eq!(m.direction, Direction::Response);
                sink.lock().push(m.decode::<Response>().unwrap());
            },
            |_| {},
        );
        seen
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_sync_handler_single_response() {
        let bus = EventBus::new(BusConfig::default());
        let seen = collect_responses(&bus, "svc");
        let _dispatcher = RequestDispatcher::start(
            &bus,
            "svc",
            &["echo"],
            None,
            Arc::new(|req: Request, responder: Responder| {
                responder.ok(&req.payload);
            }),
        )
        .unwrap();

        let request = Request::new("echo").with_payload(&json!({"n": 1})).unwrap();
        bus.send_request("svc", &request).unwrap();
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, request.id);
        assert!(!seen[0].error);
        assert_eq!(seen[0].payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_unknown_command_is_404() {
        let bus = EventBus::new(BusConfig::default());
        let seen = collect_responses(&bus, "svc");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _dispatcher = RequestDispatcher::start(
            &bus,
            "svc",
            &["known"],
            None,
            Arc::new(move |_req: Request, responder: Responder| {
                counter.fetch_add(1, Ordering::SeqCst);
                responder.ok(&"x");
            }),
        )
        .unwrap();

        bus.send_request("svc", &Request::new("nope")).unwrap();
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].error);
        assert_eq!(seen[0].error_code, 404);
    }

    #[tokio::test]
    async fn test_dropped_or_panicking_handler_fails_once() {
        let bus = EventBus::new(BusConfig::default());
        let seen = collect_responses(&bus, "svc");
        let _dispatcher = RequestDispatcher::start(
            &bus,
            "svc",
            &["drop", "panic"],
            None,
            Arc::new(|req: Request, responder: Responder| {
                if req.request == "panic" {
                    panic!("handler exploded");
                }
                drop(responder);
            }),
        )
        .unwrap();

        bus.send_request("svc", &Request::new("drop")).unwrap();
        bus.send_request("svc", &Request::new("panic")).unwrap();
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.error && r.error_code == 500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_and_late_result_is_discarded() {
        let bus = EventBus::new(BusConfig::default());
        let seen = collect_responses(&bus, "svc");
        let dispatcher = RequestDispatcher::start(
            &bus,
            "svc",
            &["slow"],
            Some(Duration::from_millis(100)),
            Arc::new(|_req: Request, responder: Responder| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    assert!(responder.is_settled());
                    assert!(!responder.ok(&"too late"));
                });
            }),
        )
        .unwrap();

        let request = Request::new("slow");
        bus.send_request("svc", &request).unwrap();
        settle().await;
        assert_eq!(dispatcher.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, request.id);
        assert_eq!(seen[0].error_code, 504);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_async_completion_before_deadline() {
        let bus = EventBus::new(BusConfig::default());
        let dispatcher = RequestDispatcher::start(
            &bus,
            "svc",
            &["later"],
            Some(Duration::from_secs(5)),
            Arc::new(|_req: Request, responder: Responder| {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    responder.ok(&json!({"done": true}));
                });
            }),
        )
        .unwrap();

        let response = bus
            .request("svc", Request::new("later"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!response.error);
        assert_eq!(response.payload["done"], true);

        dispatcher.stop();
        let err = bus
            .request("svc", Request::new("later"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestTimeout(_)));
    }
}
