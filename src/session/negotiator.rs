//! The protocol state machine for one call session
//!
//! Consumes and produces signaling messages, drives the media engine, and
//! reports lifecycle transitions upward. All methods run on the session's
//! sequential actor, so no internal locking is needed; the cancel flag is
//! the only cross-task signal, raced against in-flight engine operations.

use super::candidate_queue::{CandidateQueue, EnqueueOutcome};
use super::{CallSession, CancelFlag, ConnectionState, Role, SessionEndReason, SessionEvent};
use crate::engine::MediaEngine;
use crate::protocol::{
    ByeReason, IceCandidate, SessionDescription, SessionId, SignalingMessage,
};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub(crate) struct SessionNegotiator {
    session: CallSession,
    queue: CandidateQueue,
    engine: Arc<dyn MediaEngine>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: Arc<CancelFlag>,
    next_seq: u64,
    last_remote_seq: Option<u64>,
}

impl SessionNegotiator {
    pub(crate) fn new(
        session: CallSession,
        engine: Arc<dyn MediaEngine>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<ConnectionState>,
        cancel: Arc<CancelFlag>,
    ) -> Self {
        Self {
            session,
            queue: CandidateQueue::new(),
            engine,
            outbound,
            events,
            state_tx,
            cancel,
            next_seq: 0,
            last_remote_seq: None,
        }
    }

    pub(crate) fn id(&self) -> &SessionId {
        self.session.id()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Transition and notify; terminal reasons travel with the event
    fn set_state(&mut self, new_state: ConnectionState, reason: Option<SessionEndReason>) {
        let old_state = self.session.state();
        if old_state == new_state {
            return;
        }

        debug!(
            "Session {} state transition: {:?} -> {:?}",
            self.session.id(),
            old_state,
            new_state
        );

        self.session.state = new_state;
        let _ = self.state_tx.send(new_state);
        let _ = self.events.send(SessionEvent {
            session_id: self.session.id().clone(),
            state: new_state,
            reason,
        });
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Best-effort emission; a dead channel is the supervisor's problem
    fn send_message(&mut self, message: SignalingMessage) {
        if self.outbound.send(message).is_err() {
            warn!(
                "Session {} outbound channel gone, message dropped",
                self.session.id()
            );
        }
    }

    fn send_bye(&mut self, reason: ByeReason) {
        let seq = self.next_seq();
        let bye = SignalingMessage::bye(self.session.id().clone(), seq, reason);
        self.send_message(bye);
    }

    /// Race an engine operation against the cancel signal
    ///
    /// Returns `None` when teardown was requested mid-operation; the late
    /// engine result is discarded and the pending hangup/failure command
    /// performs the terminal transition.
    async fn engine_op<T>(&self, op: impl Future<Output = Result<T>>) -> Option<Result<T>> {
        tokio::select! {
            result = op => Some(result),
            _ = self.cancel.cancelled_wait() => None,
        }
    }

    /// Caller only, valid only from `Idle`: create and emit the offer
    pub(crate) async fn start_offer(&mut self) -> Result<()> {
        if self.session.role() != Role::Caller {
            return Err(Error::InvalidState(
                "start_offer is only valid on a caller session".to_string(),
            ));
        }
        if self.session.state() != ConnectionState::Idle {
            return Err(Error::InvalidState(format!(
                "start_offer is only valid from Idle, session {} is {:?}",
                self.session.id(),
                self.session.state()
            )));
        }

        let created = self.engine_op(self.engine.create_offer()).await;
        let offer = match created {
            Some(Ok(offer)) => offer,
            Some(Err(e)) => return Err(self.fail_media(e)),
            None => return Ok(()),
        };
        let applied = self.engine_op(self.engine.set_local_description(&offer)).await;
        match applied {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail_media(e)),
            None => return Ok(()),
        }

        self.session.local_description = Some(offer.clone());
        self.set_state(ConnectionState::OfferSent, None);

        let seq = self.next_seq();
        let msg = SignalingMessage::offer(self.session.id().clone(), seq, offer);
        self.send_message(msg);

        info!("Session {} offer sent", self.session.id());
        Ok(())
    }

    /// Dispatch one inbound message by type
    pub(crate) async fn handle_incoming(&mut self, message: SignalingMessage) -> Result<()> {
        if self.session.state().is_terminal() {
            debug!(
                "Session {} is terminal, ignoring {}",
                self.session.id(),
                message.kind()
            );
            return Ok(());
        }

        self.note_remote_seq(&message);

        match message {
            SignalingMessage::Offer { payload, .. } => self.handle_offer(payload).await,
            SignalingMessage::Answer { payload, .. } => self.handle_answer(payload).await,
            SignalingMessage::Candidate { payload, .. } => self.handle_candidate(payload).await,
            SignalingMessage::Bye { payload, .. } => {
                info!(
                    "Session {} received bye ({:?})",
                    self.session.id(),
                    payload.reason
                );
                self.queue.discard();
                self.set_state(ConnectionState::Closed, Some(SessionEndReason::RemoteBye));
                Ok(())
            }
        }
    }

    /// Sequence numbers are diagnostics only; the transport already orders
    fn note_remote_seq(&mut self, message: &SignalingMessage) {
        let seq = message.seq();
        if let Some(last) = self.last_remote_seq {
            if seq <= last {
                debug!(
                    "Session {} saw non-monotonic seq {} after {} ({})",
                    self.session.id(),
                    seq,
                    last,
                    message.kind()
                );
                return;
            }
        }
        self.last_remote_seq = Some(seq);
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.session.role() != Role::Callee || self.session.state() != ConnectionState::Idle {
            // A second offer would be a renegotiation request, which this
            // core does not support: conflicting description state is
            // unrecoverable, so the session fails.
            warn!(
                "Session {} received offer in {:?}, failing session",
                self.session.id(),
                self.session.state()
            );
            self.send_bye(ByeReason::Failure);
            self.queue.discard();
            self.set_state(
                ConnectionState::Failed,
                Some(SessionEndReason::ProtocolViolation),
            );
            return Err(Error::Protocol(format!(
                "unexpected offer on session {}",
                self.session.id()
            )));
        }

        let applied = self.engine_op(self.engine.set_remote_description(&offer)).await;
        match applied {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail_media(e)),
            None => return Ok(()),
        }
        self.session.remote_description = Some(offer);
        self.set_state(ConnectionState::OfferReceived, None);

        // Remote description is in place: release anything that arrived early.
        self.apply_flushed().await?;

        let created = self.engine_op(self.engine.create_answer()).await;
        let answer = match created {
            Some(Ok(answer)) => answer,
            Some(Err(e)) => return Err(self.fail_media(e)),
            None => return Ok(()),
        };
        let applied = self.engine_op(self.engine.set_local_description(&answer)).await;
        match applied {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail_media(e)),
            None => return Ok(()),
        }

        self.session.local_description = Some(answer.clone());
        self.set_state(ConnectionState::AnswerSent, None);

        let seq = self.next_seq();
        let msg = SignalingMessage::answer(self.session.id().clone(), seq, answer);
        self.send_message(msg);

        info!("Session {} answer sent", self.session.id());
        self.set_state(ConnectionState::Connecting, None);
        Ok(())
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.session.role() != Role::Caller
            || self.session.state() != ConnectionState::OfferSent
        {
            if self.session.remote_description.is_some() {
                // An answer on top of an applied description cannot be
                // reconciled.
                warn!(
                    "Session {} received conflicting answer in {:?}, failing session",
                    self.session.id(),
                    self.session.state()
                );
                self.send_bye(ByeReason::Failure);
                self.queue.discard();
                self.set_state(
                    ConnectionState::Failed,
                    Some(SessionEndReason::ProtocolViolation),
                );
                return Err(Error::Protocol(format!(
                    "conflicting answer on session {}",
                    self.session.id()
                )));
            }

            warn!(
                "Session {} dropping answer received in {:?}",
                self.session.id(),
                self.session.state()
            );
            return Ok(());
        }

        let applied = self.engine_op(self.engine.set_remote_description(&answer)).await;
        match applied {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail_media(e)),
            None => return Ok(()),
        }
        self.session.remote_description = Some(answer);
        self.set_state(ConnectionState::Connecting, None);

        self.apply_flushed().await?;

        info!("Session {} answer applied, connecting", self.session.id());
        Ok(())
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        match self.queue.enqueue(candidate.clone()) {
            EnqueueOutcome::ApplyNow => {
                let applied = self.engine_op(self.engine.add_ice_candidate(&candidate)).await;
                match applied {
                    Some(Ok(())) => Ok(()),
                    Some(Err(e)) => Err(self.fail_media(e)),
                    None => Ok(()),
                }
            }
            EnqueueOutcome::Buffered => {
                debug!(
                    "Session {} buffered candidate ({} pending)",
                    self.session.id(),
                    self.queue.pending_len()
                );
                Ok(())
            }
            EnqueueOutcome::Duplicate => Ok(()),
        }
    }

    /// Apply the buffered candidates in their original arrival order
    async fn apply_flushed(&mut self) -> Result<()> {
        let flushed = self.queue.flush();
        if flushed.is_empty() {
            return Ok(());
        }

        debug!(
            "Session {} applying {} buffered candidates",
            self.session.id(),
            flushed.len()
        );
        for candidate in flushed {
            let applied = self.engine_op(self.engine.add_ice_candidate(&candidate)).await;
            match applied {
                Some(Ok(())) => {}
                Some(Err(e)) => return Err(self.fail_media(e)),
                None => return Ok(()),
            }
        }
        Ok(())
    }

    /// Emit a locally gathered candidate to the remote peer
    pub(crate) fn send_candidate(&mut self, candidate: IceCandidate) {
        if self.session.state().is_terminal() {
            return;
        }
        if self.session.local_description().is_none() {
            debug!(
                "Session {} dropping local candidate before local description",
                self.session.id()
            );
            return;
        }

        let seq = self.next_seq();
        let msg = SignalingMessage::candidate(self.session.id().clone(), seq, candidate);
        self.send_message(msg);
    }

    /// Media engine callback: `Connecting -> Connected`
    pub(crate) fn report_media_connected(&mut self) {
        match self.session.state() {
            ConnectionState::Connecting => {
                info!("Session {} media connected", self.session.id());
                self.set_state(ConnectionState::Connected, None);
            }
            state if state.is_terminal() => {}
            state => {
                debug!(
                    "Session {} ignoring media-connected report in {:?}",
                    self.session.id(),
                    state
                );
            }
        }
    }

    /// Media engine callback: any non-terminal state fails
    pub(crate) fn report_media_failed(&mut self, detail: &str) {
        if self.session.state().is_terminal() {
            return;
        }

        warn!("Session {} media failed: {}", self.session.id(), detail);
        self.send_bye(ByeReason::Failure);
        self.queue.discard();
        self.set_state(ConnectionState::Failed, Some(SessionEndReason::MediaEngine));
    }

    /// Application-initiated teardown from any state
    pub(crate) fn hangup(&mut self) {
        if self.session.state().is_terminal() {
            return;
        }

        info!("Session {} hangup", self.session.id());
        self.send_bye(ByeReason::Hangup);
        self.queue.discard();
        self.set_state(ConnectionState::Closed, Some(SessionEndReason::LocalHangup));
    }

    /// Supervisor-forced failure; emits a best-effort bye where the channel
    /// may still be alive
    pub(crate) fn force_fail(&mut self, reason: SessionEndReason) {
        if self.session.state().is_terminal() {
            return;
        }

        warn!("Session {} forced to Failed: {:?}", self.session.id(), reason);
        if reason == SessionEndReason::NegotiationTimeout {
            self.send_bye(ByeReason::Timeout);
        }
        self.queue.discard();
        self.set_state(ConnectionState::Failed, Some(reason));
    }

    /// Silent close used by the glare tie-break: the outbound offer is
    /// discarded without a bye and the incoming one is processed on a new
    /// session instead
    pub(crate) fn abandon(&mut self, reason: SessionEndReason) {
        if self.session.state().is_terminal() {
            return;
        }

        info!("Session {} abandoned: {:?}", self.session.id(), reason);
        self.queue.discard();
        self.set_state(ConnectionState::Closed, Some(reason));
    }

    /// Record a fatal media-engine failure and return the error
    fn fail_media(&mut self, error: Error) -> Error {
        warn!("Session {} media engine error: {}", self.session.id(), error);
        self.send_bye(ByeReason::Failure);
        self.queue.discard();
        self.set_state(ConnectionState::Failed, Some(SessionEndReason::MediaEngine));
        error
    }
}
