//! WebSocket signaling channel
//!
//! One `SignalingChannel` owns exactly one ordered duplex message stream to a
//! signaling endpoint. It carries no protocol knowledge beyond the wire
//! framing: outbound messages are serialized and queued FIFO through a sender
//! task, inbound frames are parsed and surfaced on an event stream the owner
//! consumes. Retry policy lives with the supervisor, never here.

use crate::protocol::SignalingMessage;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Event surfaced to the channel owner
#[derive(Debug)]
pub enum ChannelEvent {
    /// A parsed inbound signaling message, in arrival order
    Message(SignalingMessage),
    /// The underlying connection dropped without a clean close
    TransportLost(String),
    /// The connection closed cleanly
    Closed,
}

/// One persistent, ordered, bidirectional message transport
///
/// Created connected; once the underlying socket ends (cleanly or not) the
/// channel is dead and a new one must be connected in its place.
pub struct SignalingChannel {
    endpoint: String,
    tx: mpsc::UnboundedSender<Message>,
    local_tx: mpsc::UnboundedSender<ChannelEvent>,
    connected: Arc<AtomicBool>,
    last_activity: Arc<RwLock<Instant>>,
}

impl SignalingChannel {
    /// Connect to the signaling endpoint
    ///
    /// Presents `auth_token` as a bearer credential during the handshake.
    /// Returns the channel plus the receiver its owner consumes; the receiver
    /// ends after a terminal [`ChannelEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on network or authentication failure.
    /// No retry is attempted here.
    pub async fn connect(
        endpoint: &str,
        auth_token: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        info!("Connecting to signaling endpoint: {}", endpoint);

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| Error::Transport(format!("Invalid endpoint: {}", e)))?;

        if let Some(token) = auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Transport(format!("Invalid auth token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling endpoint");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let connected = Arc::new(AtomicBool::new(true));
        let last_activity = Arc::new(RwLock::new(Instant::now()));

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(
            read,
            local_rx,
            event_tx,
            connected.clone(),
            last_activity.clone(),
        ));

        Ok((
            Self {
                endpoint: endpoint.to_string(),
                tx,
                local_tx,
                connected,
                last_activity,
            },
            event_rx,
        ))
    }

    /// Sender task: drains the outbound queue into the socket in FIFO order
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                warn!("Failed to send on signaling channel: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }

        debug!("Signaling sender task terminated");
    }

    /// Receiver task: parses inbound frames and surfaces channel events
    ///
    /// `local_rx` injects locally originated terminal events (clean close,
    /// stall declaration) so the owner always observes exactly one terminal
    /// event even when the socket itself never ends.
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        mut local_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        event_tx: mpsc::UnboundedSender<ChannelEvent>,
        connected: Arc<AtomicBool>,
        last_activity: Arc<RwLock<Instant>>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = read.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                local = local_rx.recv() => {
                    if let Some(event) = local {
                        let _ = event_tx.send(event);
                    }
                    break;
                }
            };

            *last_activity.write().await = Instant::now();

            match frame {
                Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                    Ok(msg) => {
                        debug!("Received {} for session {}", msg.kind(), msg.session_id());
                        if event_tx.send(ChannelEvent::Message(msg)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping malformed signaling frame: {}", e);
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling channel closed by peer");
                    let _ = event_tx.send(ChannelEvent::Closed);
                    break;
                }
                // Ping/pong/binary count as traffic but carry no protocol
                // content; tungstenite answers pings for us.
                Ok(_) => {}
                Err(e) => {
                    warn!("Signaling channel error: {}", e);
                    let _ = event_tx.send(ChannelEvent::TransportLost(e.to_string()));
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        debug!("Signaling receiver task terminated");
    }

    /// Endpoint this channel was connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the channel is still connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Enqueue a message for FIFO delivery
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel is not connected.
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }

        let json = message.to_json()?;
        debug!("Sending {} for session {}", message.kind(), message.session_id());

        self.tx
            .send(Message::Text(json))
            .map_err(|_| Error::ChannelClosed)?;

        Ok(())
    }

    /// Send a keepalive ping frame
    pub fn ping(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ChannelClosed);
        }

        self.tx
            .send(Message::Ping(Vec::new()))
            .map_err(|_| Error::ChannelClosed)?;

        Ok(())
    }

    /// Time elapsed since the last inbound frame of any kind
    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    /// Close the channel
    ///
    /// Idempotent; after the first call no further messages are accepted or
    /// delivered. The owner's event stream ends with [`ChannelEvent::Closed`].
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Closing signaling channel to {}", self.endpoint);
            let _ = self.tx.send(Message::Close(None));
            let _ = self.local_tx.send(ChannelEvent::Closed);
        }
    }

    /// Declare the channel stalled after a missed keepalive window
    ///
    /// Tears the channel down from the local side; the owner's event stream
    /// ends with [`ChannelEvent::TransportLost`]. Idempotent with `close`.
    pub fn declare_stalled(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!("Declaring signaling channel to {} stalled", self.endpoint);
            let _ = self.tx.send(Message::Close(None));
            let _ = self
                .local_tx
                .send(ChannelEvent::TransportLost("keepalive stall".to_string()));
        }
    }
}
