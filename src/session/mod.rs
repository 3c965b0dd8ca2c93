//! Call sessions and their per-session execution model
//!
//! Each call session runs as an independent actor task owning a
//! [`SessionNegotiator`](negotiator::SessionNegotiator): commands and inbound
//! messages are delivered through an unbounded mpsc queue, so no two events
//! for the same session are ever processed concurrently while different
//! sessions proceed in parallel. The [`SessionHandle`] is the cloneable
//! front the dispatcher and the application talk to.

pub mod candidate_queue;
mod negotiator;

use crate::engine::MediaEngine;
use crate::protocol::{IceCandidate, SessionDescription, SessionId, SignalingMessage};
use crate::{Error, Result};
use negotiator::SessionNegotiator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, warn};

/// Which end of the negotiation this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Originates the offer
    Caller,
    /// Answers a received offer
    Callee,
}

/// Lifecycle state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet
    Idle,
    /// Local offer emitted, awaiting the answer
    OfferSent,
    /// Remote offer applied, answer creation in progress
    OfferReceived,
    /// Local answer emitted
    AnswerSent,
    /// Descriptions exchanged, media engine establishing connectivity
    Connecting,
    /// Media engine reported media flowing
    Connected,
    /// Terminal: deliberate teardown (hangup or remote bye)
    Closed,
    /// Terminal: negotiation failed
    Failed,
}

impl ConnectionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Why a session reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// Application called hangup
    LocalHangup,
    /// Remote peer sent a bye
    RemoteBye,
    /// Outbound offer discarded by the glare tie-break
    Superseded,
    /// Media engine operation failed
    MediaEngine,
    /// Unrecoverable protocol violation on this session
    ProtocolViolation,
    /// Signaling channel dropped mid-negotiation
    TransportLost,
    /// Session did not reach Connected in time
    NegotiationTimeout,
}

/// State-change notification delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Session the transition belongs to
    pub session_id: SessionId,
    /// New state
    pub state: ConnectionState,
    /// Terminal reason, present only for `Closed` and `Failed`
    pub reason: Option<SessionEndReason>,
}

/// Identity and negotiation state for one call attempt
///
/// Mutated exclusively by the session's negotiator.
#[derive(Debug)]
pub struct CallSession {
    id: SessionId,
    role: Role,
    state: ConnectionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
}

impl CallSession {
    /// Create a session in `Idle`
    pub fn new(id: SessionId, role: Role) -> Self {
        Self {
            id,
            role,
            state: ConnectionState::Idle,
            local_description: None,
            remote_description: None,
        }
    }

    /// Session identifier, immutable for the session's lifetime
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Negotiation role, fixed at creation
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Local description, if one was created this round
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Remote description, if one was applied this round
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }
}

/// Cancellation intent shared between a handle and its actor
///
/// Set when the application hangs up or the supervisor force-fails the
/// session; the negotiator races in-flight media-engine operations against
/// it and discards their late results.
#[derive(Debug, Default)]
pub(crate) struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a waiter registering after this
        // call still wakes immediately.
        self.notify.notify_one();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled_wait(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

/// Commands processed sequentially by the session actor
enum SessionCommand {
    StartOffer { reply: oneshot::Sender<Result<()>> },
    Incoming(SignalingMessage),
    SendCandidate(IceCandidate),
    MediaConnected,
    MediaFailed(String),
    Hangup,
    ForceFail(SessionEndReason),
    Abandon(SessionEndReason),
}

/// Handle to one running call session
///
/// Cheap to clone; all methods enqueue work on the session's sequential
/// actor. Once the session reaches a terminal state the actor exits and
/// further commands become no-ops.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    role: Role,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: Arc<CancelFlag>,
}

impl SessionHandle {
    /// Spawn the actor task for a new session and return its handle
    ///
    /// `outbound` receives the messages this session emits (the supervisor
    /// forwards them to the signaling channel); `events` receives every
    /// state transition.
    pub fn spawn(
        id: SessionId,
        role: Role,
        engine: Arc<dyn MediaEngine>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let cancel = Arc::new(CancelFlag::default());

        let negotiator = SessionNegotiator::new(
            CallSession::new(id.clone(), role),
            engine,
            outbound,
            events,
            state_tx,
            cancel.clone(),
        );

        tokio::spawn(run_session(negotiator, cmd_rx, cancel.clone()));

        Self {
            id,
            role,
            cmd_tx,
            state_rx,
            cancel,
        }
    }

    /// Session identifier
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Negotiation role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether the session has reached `Closed` or `Failed`
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Watch receiver following the session's state transitions
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Request offer creation (caller role, `Idle` only)
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] outside `Idle` or on a callee session;
    /// [`Error::MediaEngine`] if offer creation failed (session is `Failed`).
    pub async fn start_offer(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::StartOffer { reply })
            .map_err(|_| Error::InvalidState("session already terminated".to_string()))?;
        response
            .await
            .map_err(|_| Error::InvalidState("session already terminated".to_string()))?
    }

    /// Application-initiated teardown; emits a bye and closes the session
    pub fn hangup(&self) {
        self.cancel.cancel();
        let _ = self.cmd_tx.send(SessionCommand::Hangup);
    }

    /// Forward a locally gathered ICE candidate to the remote peer
    ///
    /// The application (or its engine glue) calls this for each candidate
    /// the media engine trickles out.
    pub fn send_candidate(&self, candidate: IceCandidate) {
        let _ = self.cmd_tx.send(SessionCommand::SendCandidate(candidate));
    }

    /// Media engine callback: media is flowing
    pub fn media_connected(&self) {
        let _ = self.cmd_tx.send(SessionCommand::MediaConnected);
    }

    /// Media engine callback: media setup failed
    pub fn media_failed(&self, detail: impl Into<String>) {
        let _ = self.cmd_tx.send(SessionCommand::MediaFailed(detail.into()));
    }

    /// Supervisor-driven failure (transport loss, negotiation timeout)
    pub(crate) fn force_fail(&self, reason: SessionEndReason) {
        self.cancel.cancel();
        let _ = self.cmd_tx.send(SessionCommand::ForceFail(reason));
    }

    /// Discard this session's outbound offer per the glare tie-break
    pub(crate) fn supersede(&self) {
        self.cancel.cancel();
        let _ = self
            .cmd_tx
            .send(SessionCommand::Abandon(SessionEndReason::Superseded));
    }

    /// Route an inbound message to the session; returns false if the actor
    /// has already exited
    pub(crate) fn deliver(&self, message: SignalingMessage) -> bool {
        self.cmd_tx.send(SessionCommand::Incoming(message)).is_ok()
    }
}

/// Sequential event loop for one session
async fn run_session(
    mut negotiator: SessionNegotiator,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: Arc<CancelFlag>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SessionCommand::StartOffer { reply } => {
                let result = negotiator.start_offer().await;
                let _ = reply.send(result);
            }
            SessionCommand::Incoming(message) => {
                if cancel.is_cancelled() {
                    // Teardown already requested; queued messages must not
                    // mutate session state anymore.
                    debug!(
                        "Session {} cancelled, dropping queued {}",
                        negotiator.id(),
                        message.kind()
                    );
                } else if let Err(e) = negotiator.handle_incoming(message).await {
                    warn!("Session {} message handling failed: {}", negotiator.id(), e);
                }
            }
            SessionCommand::SendCandidate(candidate) => negotiator.send_candidate(candidate),
            SessionCommand::MediaConnected => negotiator.report_media_connected(),
            SessionCommand::MediaFailed(detail) => negotiator.report_media_failed(&detail),
            SessionCommand::Hangup => negotiator.hangup(),
            SessionCommand::ForceFail(reason) => negotiator.force_fail(reason),
            SessionCommand::Abandon(reason) => negotiator.abandon(reason),
        }

        if negotiator.state().is_terminal() {
            break;
        }
    }

    debug!("Session {} actor terminated", negotiator.id());
}
