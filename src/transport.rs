//! Duplex connection to the live speech service.

use crate::config::ApiConfig;
use crate::protocol::{ClientMessage, ServerMessage, SetupMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Normal closure; the only close code that does not trigger a reconnect
pub const NORMAL_CLOSE: u16 = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const AUDIO_CAPACITY: usize = 32;
const INBOUND_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Handshake rejected with HTTP {status}")]
    HandshakeRejected { status: u16 },
    #[error("Connection attempt timed out")]
    Timeout,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Connection closed")]
    Closed,
    #[error("Connection closed with code {code:?}: {reason}")]
    AbnormalClose { code: Option<u16>, reason: String },
}

impl TransportError {
    /// Failures that retrying cannot fix: a bad endpoint or a rejected key.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::UrlParse(_) => true,
            TransportError::HandshakeRejected { status } => (400..500).contains(status) && *status != 429,
            _ => false,
        }
    }

    fn from_handshake(error: tokio_tungstenite::tungstenite::Error) -> Self {
        match error {
            tokio_tungstenite::tungstenite::Error::Http(response) => TransportError::HandshakeRejected {
                status: response.status().as_u16(),
            },
            other => TransportError::WebSocket(other),
        }
    }
}

/// What the receive side of a connection reports to the session
#[derive(Debug)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The peer closed the connection. `None` means the stream ended without a close frame.
    Closed { code: Option<u16>, reason: String },
    Error(TransportError),
}

impl TransportEvent {
    /// True for a deliberate, normal close by the peer
    pub fn is_clean_close(&self) -> bool {
        matches!(self, TransportEvent::Closed { code: Some(NORMAL_CLOSE), .. })
    }
}

/// One open connection. Dropping it tears down the socket tasks.
///
/// Outbound traffic has two lanes. Microphone audio goes through a bounded
/// channel the capture path may saturate; control messages (tool responses) go
/// through their own unbounded lane, which the writer drains first, so a
/// backed-up audio lane never delays or blocks them.
pub struct Connection {
    audio: mpsc::Sender<ClientMessage>,
    control: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wrap a set of channels. Used by connectors whose I/O lives elsewhere.
    pub fn new(
        audio: mpsc::Sender<ClientMessage>,
        control: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            audio,
            control,
            inbound,
            shutdown: CancellationToken::new(),
            writer: None,
            reader: None,
        }
    }

    /// Sender for microphone audio; cloned into the capture path
    pub fn audio_sender(&self) -> mpsc::Sender<ClientMessage> {
        self.audio.clone()
    }

    /// Queue a control message. Never waits on the audio lane.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.control.send(message).map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Cancelled when the session closes this connection
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close with a normal close frame, waiting briefly for the writer to flush it.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                log::debug!("🌐 Writer did not finish closing in time");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens connections to the live service.
///
/// The setup payload is sent before the connection is handed back.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, setup: SetupMessage) -> Result<Connection, TransportError>;
}

pub struct WebSocketConnector {
    api: ApiConfig,
}

impl WebSocketConnector {
    pub fn new(api: ApiConfig) -> Self {
        Self { api }
    }

    fn endpoint(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.api.live_url)?;
        url.query_pairs_mut().append_pair("key", self.api.gemini_key());
        Ok(url)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, setup: SetupMessage) -> Result<Connection, TransportError> {
        let url = self.endpoint()?;
        log::info!("🌐 Connecting to {}", self.api.live_url);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from_handshake)?;
        let (mut write, mut read) = ws_stream.split();

        let setup_json = ClientMessage::Setup(setup).to_json()?;
        write.send(Message::Text(setup_json.into())).await?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<ClientMessage>(AUDIO_CAPACITY);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(INBOUND_CAPACITY);
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        let writer_events = inbound_tx.clone();
        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = writer_shutdown.cancelled() => break,
                    Some(msg) = control_rx.recv() => msg,
                    Some(msg) = audio_rx.recv() => msg,
                    else => break,
                };
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("🌐 Dropping unserializable message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    let _ = writer_events.send(TransportEvent::Error(e.into())).await;
                    return;
                }
            }
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(e) = write.send(close).await {
                log::debug!("🌐 Close frame not sent: {}", e);
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let payload = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    // The service also delivers JSON in binary frames
                    Ok(Message::Binary(data)) => {
                        let bytes = data.as_slice();
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                log::warn!("🌐 Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                                continue;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        log::info!("🌐 Server closed connection: {:?} {}", code, reason);
                        let _ = inbound_tx.send(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(TransportEvent::Error(e.into())).await;
                        return;
                    }
                };

                match ServerMessage::parse(&payload) {
                    Ok(message) => {
                        if inbound_tx.send(TransportEvent::Message(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("🌐 Ignoring malformed server message: {}", e),
                }
            }
            let _ = inbound_tx
                .send(TransportEvent::Closed {
                    code: None,
                    reason: String::new(),
                })
                .await;
        });

        log::info!("✅ Connected, setup sent");
        Ok(Connection {
            audio: audio_tx,
            control: control_tx,
            inbound: inbound_rx,
            shutdown,
            writer: Some(writer),
            reader: Some(reader),
        })
    }
}
