//! SIP-over-WebSocket transport
//!
//! One duplex frame channel to the SIP server per RFC 7118: each text
//! frame carries exactly one SIP message. The transport parses inbound
//! frames through the wire model and hands complete messages to the
//! dispatcher; outbound messages are rendered by the caller and queued
//! onto the socket's writer task.
//!
//! # Reconnect policy
//!
//! While not explicitly stopped, a drop schedules a retry after the
//! configured timeout, decrementing the attempts-remaining counter on
//! each schedule. The counter resets to the configured maximum on every
//! successful connect; when it reaches zero the supervisor publishes
//! `transportReconnectFailed` and gives up. Registration is *not* this
//! module's business - the registrar observes `transportConnected` on
//! the bus and applies its own settle delay.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use url::Url;

use triline_sip::Message;

use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};

/// Connection state of the WebSocket link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No socket
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Socket up, frames flowing
    Connected,
}

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

/// The WebSocket transport and its reconnect supervisor
pub struct WsTransport {
    url: Url,
    bus: Arc<EventBus>,
    state: AtomicU8,
    stopped: AtomicBool,
    attempting_reconnection: AtomicBool,
    attempts_remaining: AtomicU32,
    max_attempts: u32,
    reconnect_timeout: Duration,
    outbound: RwLock<Option<mpsc::UnboundedSender<WsFrame>>>,
    inbound_tx: mpsc::UnboundedSender<Message>,
}

impl WsTransport {
    /// Create a transport for `url`; inbound SIP messages arrive on the
    /// returned receiver once [`WsTransport::start`] runs.
    pub fn new(
        url: Url,
        max_attempts: u32,
        reconnect_timeout: Duration,
        bus: Arc<EventBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(WsTransport {
            url,
            bus,
            state: AtomicU8::new(STATE_DISCONNECTED),
            stopped: AtomicBool::new(false),
            attempting_reconnection: AtomicBool::new(false),
            attempts_remaining: AtomicU32::new(max_attempts),
            max_attempts,
            reconnect_timeout,
            outbound: RwLock::new(None),
            inbound_tx,
        });
        (transport, inbound_rx)
    }

    /// Current connection state
    pub fn state(&self) -> TransportState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => TransportState::Connected,
            STATE_CONNECTING => TransportState::Connecting,
            _ => TransportState::Disconnected,
        }
    }

    /// Reconnect attempts left before the supervisor gives up
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining.load(Ordering::SeqCst)
    }

    /// True between a drop and the next successful connect
    pub fn attempting_reconnection(&self) -> bool {
        self.attempting_reconnection.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::SeqCst);
    }

    /// Spawn the connect/reconnect supervisor
    pub fn start(self: &Arc<Self>) {
        let transport = self.clone();
        tokio::spawn(async move {
            transport.run().await;
        });
    }

    /// Stop for good: no further reconnects, socket closed
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // dropping the sender ends the writer task, which closes the socket
        *self.outbound.write().unwrap() = None;
    }

    /// Queue one rendered SIP message onto the socket
    pub fn send(&self, wire: String) -> PhoneResult<()> {
        let guard = self.outbound.read().unwrap();
        let sender = guard.as_ref().ok_or(PhoneError::TransportClosed)?;
        sender
            .send(WsFrame::Text(wire))
            .map_err(|_| PhoneError::TransportClosed)
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.set_state(STATE_CONNECTING);
            if let Err(e) = self.connect_and_pump().await {
                tracing::warn!(url = %self.url, error = %e, "websocket connect failed");
                self.bus.publish(PhoneEvent::TransportDisconnected {
                    cause: Some(e.to_string()),
                });
            }
            self.set_state(STATE_DISCONNECTED);

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let remaining = self.attempts_remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                tracing::error!(url = %self.url, "reconnect attempts exhausted");
                self.bus.publish(PhoneEvent::TransportReconnectFailed {
                    attempts: self.max_attempts,
                });
                break;
            }
            self.attempts_remaining.store(remaining - 1, Ordering::SeqCst);
            self.attempting_reconnection.store(true, Ordering::SeqCst);
            tracing::info!(
                remaining = remaining - 1,
                delay_secs = self.reconnect_timeout.as_secs(),
                "scheduling websocket reconnect"
            );
            tokio::time::sleep(self.reconnect_timeout).await;
        }
    }

    async fn connect_and_pump(&self) -> PhoneResult<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| PhoneError::transport(format!("bad websocket url: {}", e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            "sip".parse().expect("static header value"),
        );

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| PhoneError::transport(e.to_string()))?;

        self.attempts_remaining
            .store(self.max_attempts, Ordering::SeqCst);
        self.attempting_reconnection.store(false, Ordering::SeqCst);
        self.set_state(STATE_CONNECTED);
        tracing::info!(url = %self.url, "websocket connected");
        self.bus.publish(PhoneEvent::TransportConnected);

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsFrame>();
        *self.outbound.write().unwrap() = Some(out_tx);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(WsFrame::Close(None)).await;
        });

        let mut cause = None;
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsFrame::Text(text)) => match Message::parse(&text) {
                    Ok(message) => {
                        let _ = self.inbound_tx.send(message);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unparseable SIP frame");
                    }
                },
                Ok(WsFrame::Ping(payload)) => {
                    let guard = self.outbound.read().unwrap();
                    if let Some(sender) = guard.as_ref() {
                        let _ = sender.send(WsFrame::Pong(payload));
                    }
                }
                Ok(WsFrame::Close(frame)) => {
                    cause = frame.map(|f| f.reason.to_string());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    cause = Some(e.to_string());
                    break;
                }
            }
        }

        *self.outbound.write().unwrap() = None;
        writer.abort();
        tracing::info!(url = %self.url, cause = ?cause, "websocket disconnected");
        self.bus.publish(PhoneEvent::TransportDisconnected { cause });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(max: u32) -> (Arc<WsTransport>, mpsc::UnboundedReceiver<Message>) {
        let bus = Arc::new(EventBus::new());
        WsTransport::new(
            Url::parse("wss://example.invalid:8089/ws").unwrap(),
            max,
            Duration::from_secs(10),
            bus,
        )
    }

    #[test]
    fn send_without_socket_is_transport_closed() {
        let (t, _rx) = transport(5);
        assert!(matches!(
            t.send("OPTIONS sip:x SIP/2.0\r\n\r\n".into()),
            Err(PhoneError::TransportClosed)
        ));
    }

    #[test]
    fn starts_disconnected_with_full_budget() {
        let (t, _rx) = transport(5);
        assert_eq!(t.state(), TransportState::Disconnected);
        assert_eq!(t.attempts_remaining(), 5);
        assert!(!t.attempting_reconnection());
    }
}
