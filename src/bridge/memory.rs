/// In-memory broker
///
/// Stands in for a remote broker in tests and loopback runs. Sends addressed
/// to `{publish_prefix}{destination}` are routed to every session subscribed
/// to `destination`, unless a responder is installed for that destination, in
/// which case the responder consumes the send and its reply is routed instead.
use super::transport::{Connector, Frame, InboundSink, Transport};
use crate::bus::ContentType;
use crate::config::BrokerConfig;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct BrokerState {
    credentials: Option<(String, String)>,
    sessions: Mutex<Vec<Arc<Session>>>,
    responders: Mutex<HashMap<String, Responder>>,
    sent: Mutex<Vec<Frame>>,
    next_session: AtomicU64,
}

struct Session {
    id: u64,
    endpoint: String,
    publish_prefix: String,
    subscriptions: Mutex<HashSet<String>>,
    sink: InboundSink,
    open: AtomicBool,
}

impl Session {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Broker that accepts any credentials
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that rejects connects with other credentials
    pub fn with_credentials(username: &str, password: &str) -> Self {
        Self {
            state: Arc::new(BrokerState {
                credentials: Some((username.to_string(), password.to_string())),
                ..BrokerState::default()
            }),
        }
    }

    /// Install a server-side handler for sends to `destination`
    ///
    /// Returning `None` swallows the send.
    pub fn respond_with<F>(&self, destination: &str, responder: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state
            .responders
            .lock()
            .insert(destination.to_string(), Arc::new(responder));
    }

    /// Push a frame to every session subscribed to `destination`
    pub async fn inject(&self, destination: &str, body: impl Into<Vec<u8>>) -> usize {
        self.deliver(destination, body.into()).await
    }

    /// Drop every open session as if the server went away
    pub async fn sever(&self, reason: &str) {
        let sessions: Vec<Arc<Session>> = self.state.sessions.lock().drain(..).collect();
        for session in sessions {
            if session.open.swap(false, Ordering::AcqRel) {
                session.sink.lost(reason).await;
            }
        }
    }

    /// Every send received so far, with the destination as addressed
    pub fn sent(&self) -> Vec<Frame> {
        self.state.sent.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.state
            .sessions
            .lock()
            .iter()
            .filter(|s| s.is_open())
            .count()
    }

    /// Whether any open session is subscribed to `destination`
    pub fn has_subscriber(&self, destination: &str) -> bool {
        self.state
            .sessions
            .lock()
            .iter()
            .any(|s| s.is_open() && s.subscriptions.lock().contains(destination))
    }

    async fn deliver(&self, destination: &str, body: Vec<u8>) -> usize {
        let targets: Vec<Arc<Session>> = self
            .state
            .sessions
            .lock()
            .iter()
            .filter(|s| s.is_open() && s.subscriptions.lock().contains(destination))
            .cloned()
            .collect();

        let mut delivered = 0;
        for session in targets {
            if session.sink.frame(Frame::new(destination, body.clone())).await {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        config: &BrokerConfig,
        inbound: InboundSink,
    ) -> Result<Arc<dyn Transport>, BusError> {
        let endpoint = format!("memory://{}", config.server_addr);
        if let Some((username, password)) = &self.state.credentials {
            if *username != config.username || *password != config.password {
                return Err(BusError::ConnectionError {
                    endpoint,
                    reason: "bad credentials".to_string(),
                });
            }
        }

        let session = Arc::new(Session {
            id: self.state.next_session.fetch_add(1, Ordering::Relaxed),
            endpoint,
            publish_prefix: config.publish_prefix.clone(),
            subscriptions: Mutex::new(HashSet::new()),
            sink: inbound,
            open: AtomicBool::new(true),
        });
        self.state.sessions.lock().push(Arc::clone(&session));

        logger::debug(
            LogTag::Bridge,
            &format!("Memory broker session {} opened", session.id),
        );
        Ok(Arc::new(MemoryTransport {
            broker: self.clone(),
            session,
        }))
    }
}

struct MemoryTransport {
    broker: MemoryBroker,
    session: Arc<Session>,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.session.is_open() {
            Ok(())
        } else {
            Err(BusError::Transport(format!(
                "session {} is closed",
                self.session.id
            )))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> String {
        self.session.endpoint.clone()
    }

    async fn subscribe(&self, destination: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.session
            .subscriptions
            .lock()
            .insert(destination.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, destination: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.session.subscriptions.lock().remove(destination);
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        body: Vec<u8>,
        _content_type: ContentType,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker
            .state
            .sent
            .lock()
            .push(Frame::new(destination, body.clone()));

        let target = destination
            .strip_prefix(self.session.publish_prefix.as_str())
            .filter(|_| !self.session.publish_prefix.is_empty())
            .unwrap_or(destination)
            .to_string();

        let responder = self.broker.state.responders.lock().get(&target).cloned();
        match responder {
            Some(responder) => {
                if let Some(reply) = responder(&body) {
                    self.broker.deliver(&target, reply).await;
                }
            }
            None => {
                self.broker.deliver(&target, body).await;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.session.open.store(false, Ordering::Release);
        let id = self.session.id;
        self.broker.state.sessions.lock().retain(|s| s.id != id);
        Ok(())
    }
}
