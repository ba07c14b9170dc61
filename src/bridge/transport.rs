/// Transport collaborator contract
///
/// A transport is whatever speaks the broker's wire protocol. The bridge only
/// needs connect, subscribe, unsubscribe, send and disconnect; inbound frames
/// and connection loss are pushed back through an `InboundSink`.
use crate::bus::ContentType;
use crate::config::BrokerConfig;
use crate::errors::BusError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// One frame received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: String,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(destination: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
        }
    }
}

/// Events consumed by a connection's reader task, in arrival order
#[derive(Debug)]
pub(crate) enum BridgeEvent {
    Frame(Frame),
    /// Completed once every event queued before it has been routed
    Fence(oneshot::Sender<()>),
    Lost(String),
}

/// Handle a transport uses to push inbound traffic to the bridge
///
/// Bounded: a transport that outruns the reader waits here, while the reader
/// itself never waits on subscribers.
#[derive(Clone)]
pub struct InboundSink {
    tx: mpsc::Sender<BridgeEvent>,
}

impl InboundSink {
    pub(crate) fn new(tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self { tx }
    }

    /// Hand a received frame to the bridge; false once the connection is gone
    pub async fn frame(&self, frame: Frame) -> bool {
        self.tx.send(BridgeEvent::Frame(frame)).await.is_ok()
    }

    /// Report that the remote side went away
    pub async fn lost(&self, reason: impl Into<String>) {
        let _ = self.tx.send(BridgeEvent::Lost(reason.into())).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for InboundSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundSink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live broker session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable endpoint for logs and errors
    fn endpoint(&self) -> String;

    async fn subscribe(&self, destination: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, destination: &str) -> Result<(), BusError>;

    async fn send(
        &self,
        destination: &str,
        body: Vec<u8>,
        content_type: ContentType,
    ) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;
}

/// Opens transports; fails with `ConnectionError` on handshake or auth failure
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &BrokerConfig,
        inbound: InboundSink,
    ) -> Result<Arc<dyn Transport>, BusError>;
}
