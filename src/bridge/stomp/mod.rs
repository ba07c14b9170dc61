/// STOMP 1.2 over WebSocket transport
///
/// One socket per connection, split into a writer task (outbound frames and
/// optional heart-beats) and a reader task that turns MESSAGE frames into
/// inbound bridge frames. Stream end or a server ERROR frame is reported as
/// connection loss.
pub mod frame;

pub use frame::StompFrame;

use super::transport::{Connector, Frame, InboundSink, Transport};
use crate::bus::ContentType;
use crate::config::BrokerConfig;
use crate::errors::BusError;
use crate::logger::{self, LogTag};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Text message for UTF-8 frames, binary otherwise so bodies stay byte-exact
fn ws_message(frame: &StompFrame) -> WsMessage {
    match String::from_utf8(frame.encode()) {
        Ok(text) => WsMessage::Text(text),
        Err(e) => WsMessage::Binary(e.into_bytes()),
    }
}

fn ws_payload(message: &WsMessage) -> Option<&[u8]> {
    match message {
        WsMessage::Text(text) => Some(text.as_bytes()),
        WsMessage::Binary(bytes) => Some(bytes.as_slice()),
        _ => None,
    }
}

/// Opens STOMP sessions over `ws[s]://{server_addr}{ws_path}`
#[derive(Debug, Clone, Default)]
pub struct StompConnector;

impl StompConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for StompConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
        inbound: InboundSink,
    ) -> Result<Arc<dyn Transport>, BusError> {
        let url = config.ws_url();
        let connection_error = |reason: String| BusError::ConnectionError {
            endpoint: url.clone(),
            reason,
        };

        if !config.use_ws {
            return Err(connection_error(
                "only the WebSocket transport is supported (set broker.use_ws = true)".to_string(),
            ));
        }

        let parsed = url::Url::parse(&url)
            .map_err(|e| connection_error(format!("invalid broker URL: {}", e)))?;
        let host = parsed.host_str().unwrap_or("localhost").to_string();

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| connection_error(format!("WebSocket connect failed: {}", e)))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connect = StompFrame::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("login", config.username.clone())
            .with_header("passcode", config.password.clone())
            .with_header(
                "heart-beat",
                format!("{},{}", config.heartbeat_ms, config.heartbeat_ms),
            );
        ws_sender
            .send(ws_message(&connect))
            .await
            .map_err(|e| connection_error(format!("CONNECT send failed: {}", e)))?;

        // Handshake: wait for CONNECTED or ERROR
        loop {
            let message = match ws_receiver.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(connection_error(format!("handshake failed: {}", e))),
                None => return Err(connection_error("closed during handshake".to_string())),
            };
            if let WsMessage::Close(_) = message {
                return Err(connection_error("closed during handshake".to_string()));
            }
            let Some(bytes) = ws_payload(&message) else {
                continue;
            };
            let Some(frame) = StompFrame::decode(bytes)? else {
                continue;
            };
            match frame.command.as_str() {
                "CONNECTED" => {
                    logger::debug(
                        LogTag::Stomp,
                        &format!(
                            "CONNECTED version={} server={}",
                            frame.header("version").unwrap_or("?"),
                            frame.header("server").unwrap_or("?")
                        ),
                    );
                    break;
                }
                "ERROR" => {
                    let reason = frame
                        .header("message")
                        .map(str::to_string)
                        .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                    return Err(connection_error(format!("broker rejected CONNECT: {}", reason)));
                }
                other => {
                    logger::verbose(
                        LogTag::Stomp,
                        &format!("Ignoring {} frame during handshake", other),
                    );
                }
            }
        }

        let closing = Arc::new(AtomicBool::new(false));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        // Writer
        let heartbeat = config.heartbeat_ms;
        tokio::spawn(async move {
            let mut ticker = (heartbeat > 0).then(|| {
                tokio::time::interval_at(
                    tokio::time::Instant::now() + Duration::from_millis(heartbeat),
                    Duration::from_millis(heartbeat),
                )
            });
            loop {
                let message = match ticker.as_mut() {
                    Some(ticker) => tokio::select! {
                        message = outbound_rx.recv() => message,
                        _ = ticker.tick() => Some(WsMessage::Text("\n".to_string())),
                    },
                    None => outbound_rx.recv().await,
                };
                let Some(message) = message else {
                    break;
                };
                if let Err(e) = ws_sender.send(message).await {
                    logger::warning(LogTag::Stomp, &format!("WebSocket write failed: {}", e));
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader
        let reader_closing = Arc::clone(&closing);
        tokio::spawn(async move {
            let reason = loop {
                let message = match ws_receiver.next().await {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => break format!("WebSocket error: {}", e),
                    None => break "stream ended".to_string(),
                };
                if let WsMessage::Close(_) = message {
                    break "closed by server".to_string();
                }
                let Some(bytes) = ws_payload(&message) else {
                    continue;
                };
                let frame = match StompFrame::decode(bytes) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        logger::warning(LogTag::Stomp, &format!("Dropping bad frame: {}", e));
                        continue;
                    }
                };
                logger::verbose(
                    LogTag::Stomp,
                    &format!("<<< {} {:?}", frame.command, frame.headers),
                );

                match frame.command.as_str() {
                    "MESSAGE" => {
                        let Some(destination) = frame.header("destination").map(str::to_string)
                        else {
                            continue;
                        };
                        if !inbound.frame(Frame::new(destination, frame.body)).await {
                            return;
                        }
                    }
                    "ERROR" => {
                        break format!(
                            "broker error: {}",
                            frame.header("message").unwrap_or("unspecified")
                        );
                    }
                    _ => {}
                }
            };

            if !reader_closing.load(Ordering::Acquire) {
                inbound.lost(reason).await;
            }
        });

        Ok(Arc::new(StompTransport {
            endpoint: url,
            outbound: Mutex::new(Some(outbound_tx)),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            closing,
        }))
    }
}

struct StompTransport {
    endpoint: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    /// destination -> subscription id
    subscriptions: Mutex<HashMap<String, String>>,
    next_subscription: AtomicU64,
    closing: Arc<AtomicBool>,
}

impl StompTransport {
    fn write(&self, frame: StompFrame) -> Result<(), BusError> {
        logger::verbose(
            LogTag::Stomp,
            &format!(">>> {} {:?}", frame.command, frame.headers),
        );
        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(ws_message(&frame))
                .map_err(|_| BusError::Transport("socket writer has stopped".to_string())),
            None => Err(BusError::Transport("transport is disconnected".to_string())),
        }
    }
}

#[async_trait]
impl Transport for StompTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn subscribe(&self, destination: &str) -> Result<(), BusError> {
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        self.write(
            StompFrame::new("SUBSCRIBE")
                .with_header("id", id.clone())
                .with_header("destination", destination)
                .with_header("ack", "auto"),
        )?;
        self.subscriptions.lock().insert(destination.to_string(), id);
        Ok(())
    }

    async fn unsubscribe(&self, destination: &str) -> Result<(), BusError> {
        let id = self.subscriptions.lock().remove(destination);
        match id {
            Some(id) => self.write(StompFrame::new("UNSUBSCRIBE").with_header("id", id)),
            None => Ok(()),
        }
    }

    async fn send(
        &self,
        destination: &str,
        body: Vec<u8>,
        content_type: ContentType,
    ) -> Result<(), BusError> {
        self.write(
            StompFrame::new("SEND")
                .with_header("destination", destination)
                .with_header("content-type", content_type.mime())
                .with_body(body),
        )
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.write(StompFrame::new("DISCONNECT"));
        // Dropping the sender lets the writer flush and close the socket
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &StompFrame) -> StompFrame {
        let message = ws_message(frame);
        let bytes = ws_payload(&message).unwrap();
        StompFrame::decode(bytes).unwrap().unwrap()
    }

    #[test]
    fn test_binary_body_survives_websocket() {
        let frame = StompFrame::new("SEND")
            .with_header("destination", "/pub/queue/bytes")
            .with_header("content-type", "application/octet-stream")
            .with_body(vec![0xff, 0xfe, 0x01]);

        let message = ws_message(&frame);
        assert!(matches!(message, WsMessage::Binary(_)));
        assert_eq!(round_trip(&frame).body, vec![0xff, 0xfe, 0x01]);
    }

    #[test]
    fn test_utf8_frame_is_text() {
        let frame = StompFrame::new("SEND")
            .with_header("destination", "/pub/topic/words")
            .with_body(b"\"ember\"".to_vec());

        assert!(matches!(ws_message(&frame), WsMessage::Text(_)));
        assert_eq!(round_trip(&frame).body, b"\"ember\"".to_vec());
    }
}
