//! Connection Gateway: owns the single live WebSocket session.
//!
//! All outbound writes are serialized through one lock so that heartbeats,
//! log shipping and command replies never interleave a frame. The send path
//! is double-checked: a lock-free connected-flag read first (so producers on
//! a dead link fail fast without contending), then a locked re-check before
//! the actual write closes the race against a concurrent disconnect.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use signage_core::{CoreError, Envelope, encode_envelope, inflate_frame};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};

/// A connect attempt that has not established within this window is a
/// timeout failure.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

/// Authoritative connection state, mutated only by the gateway itself and
/// the reconnection controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Closed set of connect failures; the Reconnection Controller switches on
/// these rather than on raw I/O errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("connection to {0} timed out")]
    Timeout(String),
    #[error("{0} is unreachable: {1}")]
    Unreachable(String, String),
    #[error("TLS failure connecting to {0}: {1}")]
    Tls(String, String),
}

#[derive(Debug, Error)]
pub enum SendError {
    /// No session is open. The caller decides what to do with the message;
    /// producers route it to the Outbound Mailbox.
    #[error("no session is open")]
    NotConnected,
    #[error("message failed to serialize: {0}")]
    Encode(#[from] CoreError),
    #[error("transport write failed: {0}")]
    Transport(String),
}

/// Typed notifications the transport produces, delivered in order through a
/// single channel so higher layers observe a deterministic event sequence.
#[derive(Debug)]
pub enum GatewayEvent {
    Opened,
    MessageReceived(String),
    Errored(String),
    Closed { code: Option<u16>, reason: String },
}

pub struct ConnectionGateway {
    shared: Arc<Shared>,
}

/// State shared between the gateway handle and its spawned read pump.
struct Shared {
    state: AtomicU8,
    writer: Mutex<Option<WsWrite>>,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl ConnectionGateway {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                writer: Mutex::new(None),
                events_tx,
            }),
        });
        (gateway, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Flag a live retry loop in progress. Ignored while a session is open;
    /// the state belongs to the session from that point.
    pub fn mark_reconnecting(&self) {
        let _ = self.shared.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Reconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }

    /// Establish a session. `Opened` is emitted before the read pump starts
    /// so the session layer handles it (registration, mailbox flush) before
    /// any incoming traffic.
    pub async fn connect(&self, url: &str) -> Result<(), ConnectError> {
        let previous = self.state();
        self.shared.set_state(ConnectionState::Connecting);
        let (stream, _response) = match timeout(HANDSHAKE_TIMEOUT, connect_async(url)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => {
                self.shared.set_state(previous);
                return Err(classify_connect_error(url, err));
            }
            Err(_) => {
                self.shared.set_state(previous);
                return Err(ConnectError::Timeout(url.to_owned()));
            }
        };

        let (write_half, read_half) = stream.split();
        {
            let mut writer = self.shared.writer.lock().await;
            *writer = Some(write_half);
        }
        self.shared.set_state(ConnectionState::Connected);
        info!(target_url = url, "session opened");

        self.shared.emit(GatewayEvent::Opened);
        tokio::spawn(read_pump(Arc::clone(&self.shared), read_half));
        Ok(())
    }

    /// Serialize and transmit one message. At most one transmission is in
    /// flight at a time; callers racing a disconnect get `NotConnected`
    /// instead of blocking on a dead link.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        // Fast path: skip lock acquisition when clearly disconnected.
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        let text = encode_envelope(envelope)?;

        let mut writer = self.shared.writer.lock().await;
        // Locked re-check: the session may have died between the flag read
        // and acquiring the writer.
        let Some(write_half) = writer.as_mut() else {
            return Err(SendError::NotConnected);
        };

        if let Err(err) = write_half.send(Message::Text(text.into())).await {
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(SendError::Transport(err.to_string()));
        }
        debug!(message_type = envelope.type_name(), "sent");
        Ok(())
    }

    /// Terminate the session. Always emits `Closed`, even when no session is
    /// open.
    pub async fn close(&self) {
        self.shared.set_state(ConnectionState::Disconnected);
        let write_half = { self.shared.writer.lock().await.take() };
        if let Some(mut write_half) = write_half {
            let _ = write_half.send(Message::Close(None)).await;
            let _ = write_half.close().await;
        }
        self.shared.emit(GatewayEvent::Closed {
            code: None,
            reason: "closed locally".to_owned(),
        });
    }
}

async fn read_pump(gateway: Arc<Shared>, mut read_half: WsRead) {
    let mut emitted_closed = false;

    while let Some(next) = read_half.next().await {
        match next {
            Ok(Message::Text(text)) => {
                gateway.emit(GatewayEvent::MessageReceived(text.to_string()));
            }
            Ok(Message::Binary(bytes)) => match inflate_frame(&bytes) {
                Ok(text) => gateway.emit(GatewayEvent::MessageReceived(text)),
                Err(err) => {
                    // Non-fatal: drop the frame, keep the session.
                    warn!(error = %err, "dropping undecodable binary frame");
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
                gateway.set_state(ConnectionState::Disconnected);
                gateway.emit(GatewayEvent::Closed { code, reason });
                emitted_closed = true;
                break;
            }
            Ok(_) => {} // ping/pong handled by the protocol layer
            Err(err) => {
                gateway.set_state(ConnectionState::Disconnected);
                gateway.emit(GatewayEvent::Errored(err.to_string()));
                break;
            }
        }
    }

    gateway.set_state(ConnectionState::Disconnected);
    gateway.writer.lock().await.take();
    if !emitted_closed {
        gateway.emit(GatewayEvent::Closed {
            code: None,
            reason: "connection lost".to_owned(),
        });
    }
}

impl crate::mailbox::MessageSink for ConnectionGateway {
    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.send(envelope).await
    }
}

fn classify_connect_error(url: &str, err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::Refused(url.to_owned()),
            std::io::ErrorKind::TimedOut => ConnectError::Timeout(url.to_owned()),
            _ => ConnectError::Unreachable(url.to_owned(), io_err.to_string()),
        },
        tungstenite::Error::Tls(tls_err) => ConnectError::Tls(url.to_owned(), tls_err.to_string()),
        other => ConnectError::Unreachable(url.to_owned(), other.to_string()),
    }
}
