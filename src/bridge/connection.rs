/// Broker connections and galactic mappings
///
/// Each connection runs one reader task that routes inbound frames to their
/// mapped channel strictly in arrival order. Each mapping runs one forwarder
/// task, so outbound order is preserved per channel while different mappings
/// proceed independently.
use super::transport::{BridgeEvent, Connector, Frame, InboundSink, Transport};
use crate::bus::{Channel, ErrorScope, Message};
use crate::config::BrokerConfig;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

// ============================================================================
// MAPPING
// ============================================================================

/// Binding of one local channel to one remote destination
pub struct Mapping {
    connection_id: ConnectionId,
    destination: String,
    channel: Weak<Channel>,
    channel_name: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    connection: Weak<ConnectionInner>,
}

impl Mapping {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Queue a local publish for the remote destination
    ///
    /// Hands the message back when the mapping no longer forwards.
    pub(crate) fn forward(&self, message: Message) -> Result<(), Message> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|e| e.0),
            None => Err(message),
        }
    }

    fn close_outbound(&self) {
        self.outbound.lock().take();
    }

    /// Wait until every queued outbound message reached the transport
    async fn join_forwarder(&self) {
        let handle = self.forwarder.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Stop both directions and detach from the connection
    ///
    /// Outbound messages already queued are flushed, then the remote
    /// subscription is dropped, then a fence travels through the reader so
    /// frames the transport accepted earlier are still routed to the channel.
    pub(crate) async fn release(&self) -> Result<(), BusError> {
        self.close_outbound();
        self.join_forwarder().await;

        let Some(connection) = self.connection.upgrade() else {
            return Ok(());
        };

        let _ops = connection.ops.lock().await;
        let mut result = Ok(());
        if !connection.is_closed() {
            result = connection.transport.unsubscribe(&self.destination).await;

            let (done_tx, done_rx) = oneshot::channel();
            if connection.events.send(BridgeEvent::Fence(done_tx)).await.is_ok() {
                let _ = done_rx.await;
            }
        }
        connection.remove_mapping(self);
        result
    }

    /// Release without waiting, used when the channel is being destroyed
    pub(crate) fn release_in_background(self: Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = self.release().await {
                        logger::warning(
                            LogTag::Bridge,
                            &format!("Releasing '{}' failed: {}", self.destination, e),
                        );
                    }
                });
            }
            Err(_) => {
                self.close_outbound();
                if let Some(connection) = self.connection.upgrade() {
                    connection.remove_mapping(&self);
                }
            }
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("connection_id", &self.connection_id)
            .field("destination", &self.destination)
            .field("channel", &self.channel_name)
            .finish()
    }
}

async fn forward_loop(
    transport: Arc<dyn Transport>,
    publish_destination: String,
    channel: Weak<Channel>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let content_type = message.payload.content_type();
        let id = message.id;
        if let Err(e) = transport
            .send(&publish_destination, message.payload.into_bytes(), content_type)
            .await
        {
            logger::warning(
                LogTag::Bridge,
                &format!("Forward of {} to '{}' failed: {}", id, publish_destination, e),
            );
            if let Some(channel) = channel.upgrade() {
                channel.fan_out_error(&e, ErrorScope::Listeners);
            }
        } else if logger::is_debug_enabled(LogTag::Bridge) {
            logger::debug(
                LogTag::Bridge,
                &format!("Forwarded {} to '{}'", id, publish_destination),
            );
        }
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    endpoint: String,
    config: BrokerConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    /// Keyed by remote destination
    mappings: Mutex<HashMap<String, Arc<Mapping>>>,
    /// Serializes map / unmap / disconnect against each other
    ops: tokio::sync::Mutex<()>,
    events: mpsc::Sender<BridgeEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn remove_mapping(&self, mapping: &Mapping) {
        let mut mappings = self.mappings.lock();
        if let Some(current) = mappings.get(&mapping.destination) {
            if std::ptr::eq(Arc::as_ptr(current), mapping) {
                mappings.remove(&mapping.destination);
            }
        }
    }

    /// Deliver an inbound frame to the channel mapped to its destination
    fn route(&self, frame: Frame) {
        let mapping = self.mappings.lock().get(&frame.destination).cloned();
        let Some(mapping) = mapping else {
            logger::debug(
                LogTag::Bridge,
                &format!("Dropping frame for unmapped destination '{}'", frame.destination),
            );
            return;
        };
        let Some(channel) = mapping.channel.upgrade() else {
            return;
        };

        let message = Message::from_frame(&mapping.channel_name, &frame.destination, frame.body);
        channel.fan_out(Arc::new(message));
    }

    /// Move to a terminal state and notify every mapped channel once
    fn shut_down(&self, err: BusError, state: ConnectionState) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.write() = state;

        let mappings: Vec<Arc<Mapping>> = self.mappings.lock().drain().map(|(_, m)| m).collect();
        for mapping in mappings {
            mapping.close_outbound();
            if let Some(channel) = mapping.channel.upgrade() {
                if channel.clear_mapping(&mapping) {
                    let notified = channel.fan_out_error(&err, ErrorScope::All);
                    logger::debug(
                        LogTag::Bridge,
                        &format!(
                            "'{}' reverted to local, {} subscriber(s) notified",
                            mapping.channel_name, notified
                        ),
                    );
                }
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop(connection: Weak<ConnectionInner>, mut events: mpsc::Receiver<BridgeEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = connection.upgrade() else {
            break;
        };
        match event {
            BridgeEvent::Frame(frame) => inner.route(frame),
            BridgeEvent::Fence(done) => {
                let _ = done.send(());
            }
            BridgeEvent::Lost(reason) => {
                logger::error(
                    LogTag::Bridge,
                    &format!("Connection {} to {} lost: {}", inner.id, inner.endpoint, reason),
                );
                inner.shut_down(
                    BusError::ConnectionLost {
                        endpoint: inner.endpoint.clone(),
                        reason,
                    },
                    ConnectionState::Failed,
                );
                break;
            }
        }
    }
}

/// Handle to one broker connection; clones share the connection
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<ConnectionInner>,
}

impl BrokerConnection {
    /// Connect through `connector`, bounded by the configured handshake timeout
    pub(crate) async fn open(
        id: ConnectionId,
        config: &BrokerConfig,
        connector: &dyn Connector,
    ) -> Result<Self, BusError> {
        let endpoint = config.server_addr.clone();
        let (events_tx, events_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let sink = InboundSink::new(events_tx.clone());

        logger::info(
            LogTag::Bridge,
            &format!("Connecting to broker {} as '{}'", endpoint, config.username),
        );

        let transport =
            match tokio::time::timeout(config.connect_timeout(), connector.connect(config, sink))
                .await
            {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(BusError::ConnectionError {
                        endpoint,
                        reason: format!(
                            "handshake timed out after {}s",
                            config.connect_timeout().as_secs()
                        ),
                    })
                }
            };

        let inner = Arc::new(ConnectionInner {
            id,
            endpoint: transport.endpoint(),
            config: config.clone(),
            transport,
            state: RwLock::new(ConnectionState::Connected),
            mappings: Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
            events: events_tx,
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(Arc::downgrade(&inner), events_rx));
        *inner.reader.lock() = Some(reader);

        logger::info(
            LogTag::Bridge,
            &format!("Connection {} established to {}", id, inner.endpoint),
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Remote destinations currently mapped through this connection
    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.inner.mappings.lock().keys().cloned().collect();
        destinations.sort();
        destinations
    }

    fn lost_error(&self, reason: &str) -> BusError {
        BusError::ConnectionLost {
            endpoint: self.inner.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// Install a mapping for `channel` on `destination`
    pub(crate) async fn map_channel(
        &self,
        channel: &Arc<Channel>,
        destination: &str,
    ) -> Result<(), BusError> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.is_closed() {
            return Err(self.lost_error("connection is not open"));
        }

        if let Some(existing) = channel.mapping() {
            if existing.connection_id == self.inner.id && existing.destination == destination {
                return Ok(());
            }
            return Err(BusError::MappingConflict {
                channel: channel.name().to_string(),
                existing: existing.destination.clone(),
            });
        }

        if let Some(existing) = self.inner.mappings.lock().get(destination) {
            return Err(BusError::MappingConflict {
                channel: channel.name().to_string(),
                existing: format!("{} (channel '{}')", destination, existing.channel_name),
            });
        }

        self.inner.transport.subscribe(destination).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mapping = Arc::new(Mapping {
            connection_id: self.inner.id,
            destination: destination.to_string(),
            channel: Arc::downgrade(channel),
            channel_name: channel.name().to_string(),
            outbound: Mutex::new(Some(outbound_tx)),
            forwarder: Mutex::new(None),
            connection: Arc::downgrade(&self.inner),
        });

        self.inner
            .mappings
            .lock()
            .insert(destination.to_string(), Arc::clone(&mapping));

        if let Err(existing) = channel.install_mapping(Arc::clone(&mapping)) {
            // Lost a race with a concurrent mark on another connection
            self.inner.remove_mapping(&mapping);
            let _ = self.inner.transport.unsubscribe(destination).await;
            return Err(BusError::MappingConflict {
                channel: channel.name().to_string(),
                existing: existing.destination.clone(),
            });
        }

        let forwarder = tokio::spawn(forward_loop(
            Arc::clone(&self.inner.transport),
            self.inner.config.publish_destination(destination),
            Arc::downgrade(channel),
            outbound_rx,
        ));
        *mapping.forwarder.lock() = Some(forwarder);
        Ok(())
    }

    /// Tear the connection down
    ///
    /// Queued outbound messages are flushed first. Every channel still mapped
    /// through this connection reverts to local and each of its subscribers
    /// receives exactly one `ConnectionLost` error.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let _ops = self.inner.ops.lock().await;
        if self.inner.is_closed() {
            return Ok(());
        }

        let mappings: Vec<Arc<Mapping>> = self.inner.mappings.lock().values().cloned().collect();
        for mapping in &mappings {
            mapping.close_outbound();
        }
        for mapping in &mappings {
            mapping.join_forwarder().await;
        }

        self.inner
            .shut_down(self.lost_error("disconnected"), ConnectionState::Disconnected);
        let result = self.inner.transport.disconnect().await;
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }

        logger::info(
            LogTag::Bridge,
            &format!("Connection {} to {} closed", self.inner.id, self.inner.endpoint),
        );
        result
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
