//! Candidate reordering buffer
//!
//! ICE candidates may arrive on the signaling channel before the remote
//! description they presuppose. This per-session buffer holds them back until
//! the remote description is applied, preserving arrival order, so the media
//! engine only ever sees candidates it can use. Duplicate payloads are
//! detected here and dropped as idempotent no-ops.

use crate::protocol::IceCandidate;
use std::collections::HashSet;
use tracing::debug;

/// Instruction returned by [`CandidateQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Remote description is set; apply the candidate to the engine now
    ApplyNow,
    /// Remote description not yet set; candidate buffered in arrival order
    Buffered,
    /// Identical payload already seen; drop without applying
    Duplicate,
}

/// Per-session buffer that delays candidates until the remote description
/// is applied
#[derive(Debug, Default)]
pub struct CandidateQueue {
    /// Set once the remote description has been applied
    ready: bool,
    /// Candidates awaiting the remote description, arrival order
    pending: Vec<IceCandidate>,
    /// Serialized payloads seen so far, for duplicate detection
    seen: HashSet<String>,
}

impl CandidateQueue {
    /// Create an empty queue in the buffering state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arriving candidate
    ///
    /// Returns [`EnqueueOutcome::ApplyNow`] once the queue has been flushed,
    /// [`EnqueueOutcome::Buffered`] before that, and
    /// [`EnqueueOutcome::Duplicate`] for a payload seen before (buffered or
    /// already applied).
    pub fn enqueue(&mut self, candidate: IceCandidate) -> EnqueueOutcome {
        let key = match serde_json::to_string(&candidate) {
            Ok(key) => key,
            // Serialization of these plain fields cannot fail; fall back to
            // the candidate line if it somehow does.
            Err(_) => candidate.candidate.clone(),
        };

        if !self.seen.insert(key) {
            debug!("Dropping duplicate candidate: {}", candidate.candidate);
            return EnqueueOutcome::Duplicate;
        }

        if self.ready {
            EnqueueOutcome::ApplyNow
        } else {
            self.pending.push(candidate);
            EnqueueOutcome::Buffered
        }
    }

    /// Release the buffered candidates in arrival order
    ///
    /// Called exactly once, immediately after the remote description is
    /// applied. Afterwards every `enqueue` returns `ApplyNow`. A second call
    /// returns an empty vector.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        std::mem::take(&mut self.pending)
    }

    /// Drop any unflushed candidates on session teardown
    pub fn discard(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} unflushed candidates", self.pending.len());
        }
        self.pending.clear();
    }

    /// Number of candidates currently buffered
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the remote description has been applied
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}
