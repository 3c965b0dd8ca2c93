//! Connection supervision: liveness, dispatch, and recovery
//!
//! The supervisor wraps one [`SignalingChannel`] and every call session
//! multiplexed on it. It is the single consumer of the channel's inbound
//! stream and the only place cross-session fan-out happens: each message is
//! routed to its owning session's sequential actor, preserving per-session
//! FIFO order while unrelated sessions proceed in parallel.
//!
//! It also owns what the negotiators must not: keepalive pings and stall
//! detection, reconnection with bounded exponential backoff, per-session
//! negotiation deadlines, and the permanent retirement of session
//! identifiers. A reconnected channel never resumes in-flight sessions; they
//! are failed with `TransportLost` and the application retries with fresh
//! identifiers.

use crate::channel::{ChannelEvent, SignalingChannel};
use crate::config::SignalingConfig;
use crate::engine::MediaEngineFactory;
use crate::protocol::{ByeReason, IceCandidate, SessionId, SignalingMessage};
use crate::session::{
    CancelFlag, ConnectionState, Role, SessionEndReason, SessionEvent, SessionHandle,
};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Active sessions plus the tombstones of every identifier ever retired
#[derive(Default)]
struct SessionRegistry {
    active: RwLock<HashMap<SessionId, SessionHandle>>,
    retired: RwLock<HashSet<SessionId>>,
}

impl SessionRegistry {
    async fn insert(&self, handle: SessionHandle) {
        self.active
            .write()
            .await
            .insert(handle.id().clone(), handle);
    }

    async fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.active.read().await.get(id).cloned()
    }

    async fn contains(&self, id: &SessionId) -> bool {
        self.active.read().await.contains_key(id)
    }

    /// Remove a session and retire its identifier permanently
    async fn remove(&self, id: &SessionId) {
        if self.active.write().await.remove(id).is_some() {
            debug!("Retiring session identifier {}", id);
        }
        self.retired.write().await.insert(id.clone());
    }

    async fn is_retired(&self, id: &SessionId) -> bool {
        self.retired.read().await.contains(id)
    }

    async fn ids(&self) -> Vec<SessionId> {
        self.active.read().await.keys().cloned().collect()
    }

    async fn count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Remove every active session at once, retiring all identifiers
    async fn drain(&self) -> Vec<SessionHandle> {
        let drained: Vec<SessionHandle> =
            self.active.write().await.drain().map(|(_, h)| h).collect();
        let mut retired = self.retired.write().await;
        for handle in &drained {
            retired.insert(handle.id().clone());
        }
        drained
    }

    /// Caller sessions currently awaiting an answer, for glare detection
    async fn callers_awaiting_answer(&self) -> Vec<SessionHandle> {
        self.active
            .read()
            .await
            .values()
            .filter(|h| h.role() == Role::Caller && h.state() == ConnectionState::OfferSent)
            .cloned()
            .collect()
    }
}

struct Inner {
    config: SignalingConfig,
    engines: Arc<dyn MediaEngineFactory>,
    registry: SessionRegistry,
    signaling: RwLock<Option<Arc<SignalingChannel>>>,
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    /// Seq counters for rejection byes, keyed by the offered identifier;
    /// these byes have no session actor to assign seq numbers
    rejected_offers: Mutex<HashMap<SessionId, u64>>,
    shutdown: CancelFlag,
}

/// Liveness monitor and session coordinator for one signaling channel
///
/// Cheap to clone; all clones share the same channel and session registry.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Connect the signaling channel and start supervision
    ///
    /// Returns the supervisor plus the stream of session state-change
    /// notifications for the application.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the initial
    /// connection fails; the initial connect is not retried.
    pub async fn connect(
        config: SignalingConfig,
        engines: Arc<dyn MediaEngineFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let (channel, channel_events) =
            SignalingChannel::connect(&config.endpoint, config.auth_token.as_deref()).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            engines,
            registry: SessionRegistry::default(),
            signaling: RwLock::new(Some(Arc::new(channel))),
            outbound_tx,
            events_tx,
            rejected_offers: Mutex::new(HashMap::new()),
            shutdown: CancelFlag::default(),
        });

        tokio::spawn(outbound_loop(inner.clone(), outbound_rx));
        tokio::spawn(dispatch_loop(inner.clone(), channel_events));
        tokio::spawn(heartbeat_loop(inner.clone()));

        Ok((Self { inner }, events_rx))
    }

    /// Start an outbound call with a freshly minted session identifier
    pub async fn start_call(&self) -> Result<SessionId> {
        self.start_call_with_id(SessionId::random()).await
    }

    /// Start an outbound call under an application-chosen identifier
    ///
    /// # Errors
    ///
    /// Fails if the identifier was retired by an earlier negotiation, is
    /// already active, the session limit is reached, or offer creation
    /// fails.
    pub async fn start_call_with_id(&self, id: SessionId) -> Result<SessionId> {
        let inner = &self.inner;

        if inner.shutdown.is_cancelled() {
            return Err(Error::InvalidState("supervisor is shut down".to_string()));
        }
        if inner.registry.is_retired(&id).await {
            return Err(Error::SessionRetired(id));
        }
        if inner.registry.contains(&id).await {
            return Err(Error::InvalidState(format!(
                "session {} already exists",
                id
            )));
        }
        if inner.config.max_sessions > 0
            && inner.registry.count().await >= inner.config.max_sessions
        {
            return Err(Error::SessionLimit(inner.config.max_sessions));
        }

        let engine = inner.engines.create_engine(&id).await?;
        let handle = SessionHandle::spawn(
            id.clone(),
            Role::Caller,
            engine,
            inner.outbound_tx.clone(),
            inner.events_tx.clone(),
        );
        inner.registry.insert(handle.clone()).await;
        spawn_session_janitor(inner.clone(), handle.clone());

        handle.start_offer().await?;
        Ok(id)
    }

    /// Tear down one session deliberately
    pub async fn hangup(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        handle.hangup();
        Ok(())
    }

    /// Forward a locally gathered ICE candidate to the remote peer
    pub async fn send_candidate(&self, id: &SessionId, candidate: IceCandidate) -> Result<()> {
        let handle = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        handle.send_candidate(candidate);
        Ok(())
    }

    /// Media engine callback: media is flowing for the session
    pub async fn media_connected(&self, id: &SessionId) -> Result<()> {
        let handle = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        handle.media_connected();
        Ok(())
    }

    /// Media engine callback: media setup failed for the session
    pub async fn media_failed(&self, id: &SessionId, detail: impl Into<String>) -> Result<()> {
        let handle = self
            .inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::SessionNotFound(id.clone()))?;
        handle.media_failed(detail);
        Ok(())
    }

    /// Current state of a session, if it is still active
    pub async fn state_of(&self, id: &SessionId) -> Option<ConnectionState> {
        self.inner.registry.get(id).await.map(|h| h.state())
    }

    /// Identifiers of all active sessions
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.ids().await
    }

    /// Number of active sessions
    pub async fn session_count(&self) -> usize {
        self.inner.registry.count().await
    }

    /// Hang up every session and close the channel
    pub async fn shutdown(&self) {
        info!("Shutting down signaling supervisor");

        for handle in self.inner.registry.drain().await {
            handle.hangup();
        }

        // Best-effort: let the final byes reach the socket queue before the
        // close frame.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        self.inner.shutdown.cancel();
        if let Some(channel) = self.inner.signaling.write().await.take() {
            channel.close();
        }
    }
}

/// Forwards session-emitted messages onto whichever channel is current
async fn outbound_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<SignalingMessage>) {
    while let Some(message) = rx.recv().await {
        let channel = inner.signaling.read().await.clone();
        match channel {
            Some(channel) => {
                if let Err(e) = channel.send(&message) {
                    warn!(
                        "Dropping outbound {} for session {}: {}",
                        message.kind(),
                        message.session_id(),
                        e
                    );
                }
            }
            None => {
                debug!(
                    "No signaling channel, dropping outbound {} for session {}",
                    message.kind(),
                    message.session_id()
                );
            }
        }
    }
}

/// Keepalive pings plus stall detection for the current channel
async fn heartbeat_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(inner.config.heartbeat_interval()) => {}
            _ = inner.shutdown.cancelled_wait() => return,
        }

        let channel = inner.signaling.read().await.clone();
        let Some(channel) = channel else { continue };
        if !channel.is_connected() {
            continue;
        }

        if channel.idle_for().await >= inner.config.stall_timeout() {
            channel.declare_stalled();
        } else if let Err(e) = channel.ping() {
            debug!("Keepalive ping failed: {}", e);
        }
    }
}

/// Single consumer of the channel's event stream; reconnects across losses
async fn dispatch_loop(inner: Arc<Inner>, mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>) {
    loop {
        let loss_reason = loop {
            let event = tokio::select! {
                event = channel_events.recv() => event,
                _ = inner.shutdown.cancelled_wait() => None,
            };
            match event {
                Some(ChannelEvent::Message(message)) => route(&inner, message).await,
                Some(ChannelEvent::TransportLost(reason)) => break reason,
                Some(ChannelEvent::Closed) => break "channel closed".to_string(),
                None => break "channel tasks ended".to_string(),
            }
        };

        if let Some(channel) = inner.signaling.write().await.take() {
            channel.close();
        }

        if inner.shutdown.is_cancelled() {
            debug!("Supervisor dispatcher stopped");
            return;
        }

        // A dropped channel cannot guarantee in-flight delivery; every
        // active session is failed rather than silently resumed.
        let active = inner.registry.drain().await;
        warn!(
            "Signaling channel lost ({}); failing {} active sessions",
            loss_reason,
            active.len()
        );
        for handle in active {
            handle.force_fail(SessionEndReason::TransportLost);
        }

        match reconnect(&inner).await {
            Some(events) => channel_events = events,
            None => {
                error!("Signaling reconnection abandoned");
                return;
            }
        }
    }
}

/// Bounded exponential backoff reconnect; `None` when giving up
async fn reconnect(inner: &Arc<Inner>) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
    let max = inner.config.reconnect_max_attempts;
    for attempt in 0..max {
        let delay = inner.config.reconnect_delay(attempt);
        info!(
            "Signaling reconnect attempt {}/{} in {:?}",
            attempt + 1,
            max,
            delay
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled_wait() => return None,
        }

        match SignalingChannel::connect(
            &inner.config.endpoint,
            inner.config.auth_token.as_deref(),
        )
        .await
        {
            Ok((channel, events)) => {
                info!("Signaling channel reconnected");
                *inner.signaling.write().await = Some(Arc::new(channel));
                return Some(events);
            }
            Err(e) => {
                warn!("Signaling reconnect attempt {} failed: {}", attempt + 1, e);
            }
        }
    }
    None
}

/// Route one inbound message to its owning session
async fn route(inner: &Arc<Inner>, message: SignalingMessage) {
    let session_id = message.session_id().clone();

    if let Some(handle) = inner.registry.get(&session_id).await {
        if !handle.deliver(message) {
            // Actor already exited; retire the identifier and drop.
            inner.registry.remove(&session_id).await;
        }
        return;
    }

    if inner.registry.is_retired(&session_id).await {
        debug!(
            "Dropping {} for retired session {}",
            message.kind(),
            session_id
        );
        return;
    }

    match &message {
        SignalingMessage::Offer { .. } => accept_incoming_offer(inner, message).await,
        _ => {
            warn!(
                "Protocol violation: {} for unknown session {}, dropped",
                message.kind(),
                session_id
            );
        }
    }
}

/// Create a callee session for an offer on an unknown identifier
///
/// Applies the glare tie-break first: when exactly one local caller offer is
/// awaiting its answer, the side whose session identifier orders
/// lexicographically smaller yields by discarding its own offer and taking
/// the callee role for the incoming one.
async fn accept_incoming_offer(inner: &Arc<Inner>, message: SignalingMessage) {
    let incoming_id = message.session_id().clone();

    let in_flight = inner.registry.callers_awaiting_answer().await;
    if in_flight.len() == 1 {
        let local = &in_flight[0];
        if local.id() < &incoming_id {
            info!(
                "Glare: yielding local offer {} to incoming offer {}",
                local.id(),
                incoming_id
            );
            local.supersede();
            inner.registry.remove(local.id()).await;
        } else {
            info!(
                "Glare: ignoring incoming offer {} (local offer {} wins)",
                incoming_id,
                local.id()
            );
            return;
        }
    }

    if inner.config.max_sessions > 0
        && inner.registry.count().await >= inner.config.max_sessions
    {
        warn!(
            "Rejecting incoming offer {}: session limit {} reached",
            incoming_id, inner.config.max_sessions
        );
        let seq = {
            let mut rejected = inner.rejected_offers.lock().await;
            let seq = rejected.entry(incoming_id.clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        let _ = inner.outbound_tx.send(SignalingMessage::bye(
            incoming_id,
            seq,
            ByeReason::Failure,
        ));
        return;
    }

    let engine = match inner.engines.create_engine(&incoming_id).await {
        Ok(engine) => engine,
        Err(e) => {
            warn!(
                "Media engine creation failed for incoming offer {}: {}",
                incoming_id, e
            );
            return;
        }
    };

    info!("Accepting incoming call {}", incoming_id);
    let handle = SessionHandle::spawn(
        incoming_id.clone(),
        Role::Callee,
        engine,
        inner.outbound_tx.clone(),
        inner.events_tx.clone(),
    );
    inner.registry.insert(handle.clone()).await;
    spawn_session_janitor(inner.clone(), handle.clone());
    handle.deliver(message);
}

/// Per-session watchdog: enforces the negotiation deadline, then retires the
/// identifier once the session terminates
fn spawn_session_janitor(inner: Arc<Inner>, handle: SessionHandle) {
    tokio::spawn(async move {
        let mut states = handle.state_stream();
        let deadline = tokio::time::sleep(inner.config.negotiation_timeout());
        tokio::pin!(deadline);

        loop {
            let state = *states.borrow();
            if state == ConnectionState::Connected || state.is_terminal() {
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        "Session {} did not connect within {:?}",
                        handle.id(),
                        inner.config.negotiation_timeout()
                    );
                    handle.force_fail(SessionEndReason::NegotiationTimeout);
                    break;
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        loop {
            if states.borrow().is_terminal() {
                break;
            }
            if states.changed().await.is_err() {
                break;
            }
        }

        inner.registry.remove(handle.id()).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngineFactory;
    use crate::protocol::SessionDescription;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

    type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    /// Room-style relay: every text frame from one client is forwarded to
    /// all other clients, mirroring a minimal signaling server.
    async fn spawn_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (bus, _) = tokio::sync::broadcast::channel::<(usize, String)>(256);

        tokio::spawn(async move {
            let mut next_id = 0usize;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let id = next_id;
                next_id += 1;
                let bus = bus.clone();
                let mut bus_rx = bus.subscribe();

                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            frame = read.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    let _ = bus.send((id, text));
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            forwarded = bus_rx.recv() => {
                                if let Ok((from, text)) = forwarded {
                                    if from != id
                                        && write.send(WsMessage::Text(text)).await.is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                });
            }
        });

        format!("ws://{}", addr)
    }

    async fn raw_client(url: &str) -> RawClient {
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn next_signaling(client: &mut RawClient) -> SignalingMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a signaling frame")
                .expect("relay connection ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return SignalingMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event stream ended")
    }

    fn test_config(endpoint: String) -> SignalingConfig {
        SignalingConfig {
            endpoint,
            heartbeat_interval_ms: 200,
            stall_timeout_ms: 60_000,
            negotiation_timeout_ms: 30_000,
            reconnect_initial_delay_ms: 50,
            reconnect_max_delay_ms: 100,
            reconnect_max_attempts: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_incoming_offer_creates_callee_session_and_answers() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let (supervisor, mut events) =
            ConnectionSupervisor::connect(test_config(url.clone()), factory.clone())
                .await
                .unwrap();

        let mut peer = raw_client(&url).await;
        peer.send(WsMessage::Text(
            SignalingMessage::offer(
                SessionId::from("call-1"),
                1,
                SessionDescription::offer("v=0"),
            )
            .to_json()
            .unwrap(),
        ))
        .await
        .unwrap();

        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferReceived);
        assert_eq!(next_event(&mut events).await.state, ConnectionState::AnswerSent);
        assert_eq!(next_event(&mut events).await.state, ConnectionState::Connecting);

        let answer = next_signaling(&mut peer).await;
        assert_eq!(answer.kind(), "answer");
        assert_eq!(answer.session_id().as_str(), "call-1");

        let id = SessionId::from("call-1");
        supervisor.media_connected(&id).await.unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.state, ConnectionState::Connected);
        assert_eq!(supervisor.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_offer_for_unknown_session_is_dropped() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let (supervisor, _events) =
            ConnectionSupervisor::connect(test_config(url.clone()), factory)
                .await
                .unwrap();

        let mut peer = raw_client(&url).await;
        peer.send(WsMessage::Text(
            SignalingMessage::candidate(
                SessionId::from("ghost"),
                1,
                IceCandidate::new("candidate:0"),
            )
            .to_json()
            .unwrap(),
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_limit_rejects_outbound_calls() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let mut config = test_config(url);
        config.max_sessions = 1;
        let (supervisor, _events) = ConnectionSupervisor::connect(config, factory)
            .await
            .unwrap();

        supervisor.start_call().await.unwrap();
        let err = supervisor.start_call().await.unwrap_err();
        assert!(matches!(err, Error::SessionLimit(1)));
    }

    #[tokio::test]
    async fn test_session_limit_bye_seq_increments_per_identifier() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let mut config = test_config(url.clone());
        config.max_sessions = 1;
        let (supervisor, mut events) = ConnectionSupervisor::connect(config, factory)
            .await
            .unwrap();

        let mut peer = raw_client(&url).await;

        // Occupy the single slot and move the session past OfferSent so the
        // repeated offer below hits the limit check, not the glare path.
        let id = supervisor.start_call().await.unwrap();
        let offer = next_signaling(&mut peer).await;
        assert_eq!(offer.session_id(), &id);
        peer.send(WsMessage::Text(
            SignalingMessage::answer(id.clone(), 1, SessionDescription::answer("v=0"))
                .to_json()
                .unwrap(),
        ))
        .await
        .unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);
        assert_eq!(next_event(&mut events).await.state, ConnectionState::Connecting);

        // The same busy identifier is offered twice; each rejection bye must
        // carry the next seq for that identifier.
        for expected_seq in 1..=2u64 {
            peer.send(WsMessage::Text(
                SignalingMessage::offer(
                    SessionId::from("busy-1"),
                    expected_seq,
                    SessionDescription::offer("v=0"),
                )
                .to_json()
                .unwrap(),
            ))
            .await
            .unwrap();

            let bye = next_signaling(&mut peer).await;
            assert_eq!(bye.kind(), "bye");
            assert_eq!(bye.session_id().as_str(), "busy-1");
            assert_eq!(bye.seq(), expected_seq);
        }
    }

    #[tokio::test]
    async fn test_transport_loss_fails_sessions_and_retires_ids() {
        // Single-accept server: after the first connection drops, reconnect
        // attempts find the listener gone.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Swallow the offer, then drop without a closing handshake.
            let _ = ws.next().await;
        });

        let factory = MockEngineFactory::new();
        let (supervisor, mut events) =
            ConnectionSupervisor::connect(test_config(url), factory)
                .await
                .unwrap();

        let id = supervisor.start_call().await.unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);

        server.await.unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.state, ConnectionState::Failed);
        assert_eq!(event.reason, Some(SessionEndReason::TransportLost));

        // The identifier is retired permanently.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.session_count().await, 0);
        let err = supervisor.start_call_with_id(id).await.unwrap_err();
        assert!(matches!(err, Error::SessionRetired(_)));
    }

    #[tokio::test]
    async fn test_reconnect_restores_signaling_for_new_calls() {
        // First connection is dropped after swallowing the offer; the second
        // one answers every offer it receives.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (reconnected_tx, reconnected_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = reconnected_tx.send(());
            while let Some(Ok(frame)) = ws.next().await {
                if let WsMessage::Text(text) = frame {
                    let msg = SignalingMessage::from_json(&text).unwrap();
                    if let SignalingMessage::Offer { session_id, .. } = msg {
                        let answer = SignalingMessage::answer(
                            session_id,
                            1,
                            SessionDescription::answer("v=0"),
                        );
                        ws.send(WsMessage::Text(answer.to_json().unwrap()))
                            .await
                            .unwrap();
                    }
                }
            }
        });

        let factory = MockEngineFactory::new();
        let (supervisor, mut events) =
            ConnectionSupervisor::connect(test_config(url), factory)
                .await
                .unwrap();

        let first = supervisor.start_call().await.unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);

        let event = next_event(&mut events).await;
        assert_eq!(event.session_id, first);
        assert_eq!(event.state, ConnectionState::Failed);
        assert_eq!(event.reason, Some(SessionEndReason::TransportLost));

        // Wait until the replacement channel is installed, then place a
        // fresh call over it.
        tokio::time::timeout(Duration::from_secs(5), reconnected_rx)
            .await
            .expect("supervisor did not reconnect")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = supervisor.start_call().await.unwrap();
        assert_ne!(second, first);
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);
        let event = next_event(&mut events).await;
        assert_eq!(event.session_id, second);
        assert_eq!(event.state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_glare_smaller_local_id_yields() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let (supervisor, mut events) =
            ConnectionSupervisor::connect(test_config(url.clone()), factory)
                .await
                .unwrap();

        let mut peer = raw_client(&url).await;

        supervisor
            .start_call_with_id(SessionId::from("aaa"))
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);
        let offer = next_signaling(&mut peer).await;
        assert_eq!(offer.session_id().as_str(), "aaa");

        // The peer offered concurrently under a larger identifier.
        peer.send(WsMessage::Text(
            SignalingMessage::offer(
                SessionId::from("zzz"),
                1,
                SessionDescription::offer("v=0"),
            )
            .to_json()
            .unwrap(),
        ))
        .await
        .unwrap();

        // The local offer is discarded without a bye and the incoming offer
        // proceeds as a callee session. The two sessions emit on independent
        // actors, so collect until both outcomes are seen.
        let mut superseded = false;
        let mut callee_created = false;
        while !(superseded && callee_created) {
            let event = next_event(&mut events).await;
            match (event.session_id.as_str(), event.state) {
                ("aaa", ConnectionState::Closed) => {
                    assert_eq!(event.reason, Some(SessionEndReason::Superseded));
                    superseded = true;
                }
                ("aaa", state) => panic!("unexpected transition for aaa: {:?}", state),
                ("zzz", ConnectionState::OfferReceived) => callee_created = true,
                ("zzz", _) => {}
                (other, _) => panic!("unexpected session {}", other),
            }
        }

        let answer = next_signaling(&mut peer).await;
        assert_eq!(answer.kind(), "answer");
        assert_eq!(answer.session_id().as_str(), "zzz");
    }

    #[tokio::test]
    async fn test_glare_larger_local_id_wins() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let (supervisor, mut events) =
            ConnectionSupervisor::connect(test_config(url.clone()), factory)
                .await
                .unwrap();

        let mut peer = raw_client(&url).await;

        supervisor
            .start_call_with_id(SessionId::from("zzz"))
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);
        let _offer = next_signaling(&mut peer).await;

        peer.send(WsMessage::Text(
            SignalingMessage::offer(
                SessionId::from("aaa"),
                1,
                SessionDescription::offer("v=0"),
            )
            .to_json()
            .unwrap(),
        ))
        .await
        .unwrap();

        // The losing offer is ignored; our session keeps waiting for its
        // answer.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.session_count().await, 1);
        assert_eq!(
            supervisor.state_of(&SessionId::from("zzz")).await,
            Some(ConnectionState::OfferSent)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_negotiation_timeout_forces_failed_with_bye() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let mut config = test_config(url.clone());
        config.negotiation_timeout_ms = 200;
        let (supervisor, mut events) = ConnectionSupervisor::connect(config, factory)
            .await
            .unwrap();

        let mut peer = raw_client(&url).await;
        let id = supervisor.start_call().await.unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);
        let _offer = next_signaling(&mut peer).await;

        let event = next_event(&mut events).await;
        assert_eq!(event.state, ConnectionState::Failed);
        assert_eq!(event.reason, Some(SessionEndReason::NegotiationTimeout));

        let bye = next_signaling(&mut peer).await;
        assert!(matches!(
            bye,
            SignalingMessage::Bye { payload, .. } if payload.reason == ByeReason::Timeout
        ));

        // Retry requires a fresh identifier.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = supervisor.start_call_with_id(id).await.unwrap_err();
        assert!(matches!(err, Error::SessionRetired(_)));
    }

    #[tokio::test]
    async fn test_stalled_channel_fails_sessions_as_transport_lost() {
        // Server that completes the handshake and then never reads or
        // writes, so keepalives go unanswered.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(ws);
        });

        let factory = MockEngineFactory::new();
        let mut config = test_config(url);
        config.heartbeat_interval_ms = 50;
        config.stall_timeout_ms = 150;
        let (supervisor, mut events) = ConnectionSupervisor::connect(config, factory)
            .await
            .unwrap();

        supervisor.start_call().await.unwrap();
        assert_eq!(next_event(&mut events).await.state, ConnectionState::OfferSent);

        let event = next_event(&mut events).await;
        assert_eq!(event.state, ConnectionState::Failed);
        assert_eq!(event.reason, Some(SessionEndReason::TransportLost));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_calls() {
        let url = spawn_relay().await;
        let factory = MockEngineFactory::new();
        let (supervisor, _events) =
            ConnectionSupervisor::connect(test_config(url), factory)
                .await
                .unwrap();

        supervisor.start_call().await.unwrap();
        supervisor.shutdown().await;

        assert_eq!(supervisor.session_count().await, 0);
        let err = supervisor.start_call().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
