/// Event bus - named channels, subscriptions and broker bridging
///
/// `EventBus` is an explicitly constructed handle; clones share one bus.
/// Components that need the bus receive it (there is no process-wide
/// accessor).
///
/// ```rust,ignore
/// let bus = EventBus::new(BusConfig::default());
/// let words = bus.listen_stream("random-word")?;
/// words.handle(
///     |msg| println!("{:?}", msg.decode::<String>()),
///     |err| eprintln!("{}", err),
/// );
/// bus.publish("random-word", Payload::text("ember"))?;
/// ```
pub mod channel;
pub mod message;
pub mod registry;
pub mod subscription;

#[cfg(test)]
mod tests;

pub use channel::{Channel, ErrorScope};
pub use message::{ContentType, Direction, Message, Payload, Request, Response};
pub use registry::ChannelManager;
pub use subscription::{Cardinality, Interest, Subscription, SubscriptionId};

use crate::bridge::{BrokerConnection, ConnectionId, Connector};
use crate::config::{BrokerConfig, BusConfig};
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct BusInner {
    channels: ChannelManager,
    connections: Mutex<HashMap<ConnectionId, BrokerConnection>>,
    next_connection_id: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: ChannelManager::new(config),
                connections: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    // ========================================================================
    // CHANNELS
    // ========================================================================

    pub fn create_channel(&self, name: &str) -> Arc<Channel> {
        self.inner.channels.create_channel(name)
    }

    pub fn create_channel_exclusive(&self, name: &str) -> Result<Arc<Channel>, BusError> {
        self.inner.channels.create_channel_exclusive(name)
    }

    pub fn destroy_channel(&self, name: &str) -> Result<(), BusError> {
        self.inner.channels.destroy_channel(name)
    }

    pub fn channel_exists(&self, name: &str) -> bool {
        self.inner.channels.channel_exists(name)
    }

    pub fn is_galactic(&self, name: &str) -> bool {
        self.inner
            .channels
            .get_channel(name)
            .map(|c| c.is_galactic())
            .unwrap_or(false)
    }

    // ========================================================================
    // PUBLISH
    // ========================================================================

    /// Publish a payload for response listeners
    pub fn publish(&self, channel: &str, payload: Payload) -> Result<(), BusError> {
        self.inner
            .channels
            .publish(channel, Message::response(channel, payload))
    }

    pub fn publish_message(&self, channel: &str, message: Message) -> Result<(), BusError> {
        self.inner.channels.publish(channel, message)
    }

    pub fn send_request(&self, channel: &str, request: &Request) -> Result<(), BusError> {
        let payload = Payload::json(request)?;
        self.inner
            .channels
            .publish(channel, Message::request(channel, payload))
    }

    pub fn send_response(&self, channel: &str, response: &Response) -> Result<(), BusError> {
        let payload = Payload::json(response)?;
        self.inner
            .channels
            .publish(channel, Message::response(channel, payload))
    }

    /// Deliver an error to the channel's response listeners
    pub fn send_error(&self, channel: &str, err: BusError) -> Result<(), BusError> {
        self.inner.channels.publish_error(channel, err)
    }

    // ========================================================================
    // LISTEN
    // ========================================================================

    pub fn listen_once(&self, channel: &str) -> Result<Subscription, BusError> {
        self.inner
            .channels
            .subscribe(channel, Cardinality::Once, Interest::Responses)
    }

    pub fn listen_stream(&self, channel: &str) -> Result<Subscription, BusError> {
        self.inner
            .channels
            .subscribe(channel, Cardinality::Stream, Interest::Responses)
    }

    pub fn listen_request_once(&self, channel: &str) -> Result<Subscription, BusError> {
        self.inner
            .channels
            .subscribe(channel, Cardinality::Once, Interest::Requests)
    }

    pub fn listen_request_stream(&self, channel: &str) -> Result<Subscription, BusError> {
        self.inner
            .channels
            .subscribe(channel, Cardinality::Stream, Interest::Requests)
    }

    /// Send a request and wait for the Response carrying its id
    ///
    /// Connection loss or channel teardown while waiting resolves with that
    /// error; an expired `timeout` resolves with `RequestTimeout`.
    pub async fn request(
        &self,
        channel: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, BusError> {
        let subscription = self.listen_stream(channel)?;
        let (tx, rx) = oneshot::channel::<Result<Response, BusError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let id = request.id;

        let tx_ok = Arc::clone(&tx);
        let tx_err = tx;
        subscription.handle(
            move |message| {
                if let Ok(response) = message.decode::<Response>() {
                    if response.id == id {
                        if let Some(tx) = tx_ok.lock().take() {
                            let _ = tx.send(Ok(response));
                        }
                    }
                }
            },
            move |err| {
                if err.is_connection_failure() || matches!(err, BusError::Cancelled(_)) {
                    if let Some(tx) = tx_err.lock().take() {
                        let _ = tx.send(Err(err.clone()));
                    }
                }
            },
        );

        if let Err(e) = self.send_request(channel, &request) {
            subscription.close();
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        subscription.close();
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Cancelled(channel.to_string())),
            Err(_) => Err(BusError::RequestTimeout(id.to_string())),
        }
    }

    // ========================================================================
    // BROKER
    // ========================================================================

    /// Open a broker connection; nothing is registered when it fails
    pub async fn connect_broker(
        &self,
        config: &BrokerConfig,
        connector: &dyn Connector,
    ) -> Result<BrokerConnection, BusError> {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = BrokerConnection::open(id, config, connector).await?;
        self.inner
            .connections
            .lock()
            .insert(id, connection.clone());
        Ok(connection)
    }

    pub fn connections(&self) -> Vec<BrokerConnection> {
        let mut connections: Vec<BrokerConnection> =
            self.inner.connections.lock().values().cloned().collect();
        connections.sort_by_key(|c| c.id());
        connections
    }

    pub async fn disconnect_broker(&self, id: ConnectionId) -> Result<(), BusError> {
        let connection = self.inner.connections.lock().remove(&id);
        match connection {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    /// Disconnect every broker connection, reporting the first failure
    pub async fn disconnect_all(&self) -> Result<(), BusError> {
        let connections: Vec<BrokerConnection> =
            self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        let mut first_error = None;
        for connection in connections {
            if let Err(e) = connection.disconnect().await {
                logger::warning(
                    LogTag::Bridge,
                    &format!("Disconnect of {} failed: {}", connection.endpoint(), e),
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn mark_galactic(
        &self,
        channel: &str,
        destination: &str,
        connection: &BrokerConnection,
    ) -> Result<(), BusError> {
        self.inner
            .channels
            .mark_galactic(channel, destination, connection)
            .await
    }

    pub async fn mark_local(&self, channel: &str) -> Result<(), BusError> {
        self.inner.channels.mark_local(channel).await
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.inner.channels.channel_names())
            .field("connections", &self.inner.connections.lock().len())
            .finish()
    }
}
