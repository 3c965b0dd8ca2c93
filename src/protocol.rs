//! Wire message types for the signaling protocol
//!
//! Every control-plane unit exchanged between peers is a [`SignalingMessage`]:
//! a JSON object tagged by `type` and correlated to a call session by
//! `sessionId`. The transport already guarantees ordering; the per-session
//! `seq` counter exists for diagnostics and duplicate detection only.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque session identifier, unique per negotiation attempt
///
/// Identifiers are minted once and retired permanently when the session
/// reaches a terminal state. The derived lexicographic ordering is what the
/// glare tie-break rule compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh random session identifier
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// View the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Session description originated by the caller
    Offer,
    /// Session description answering an offer
    Answer,
}

/// An SDP-like session description blob
///
/// Matches the JSON shape of a browser `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind (offer or answer)
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Construct an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Construct an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate blob
///
/// Matches the JSON shape of a browser `RTCIceCandidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Construct a candidate from a bare candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Reason code carried by a `bye` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByeReason {
    /// Deliberate local teardown
    Hangup,
    /// Session failed locally (media engine or protocol error)
    Failure,
    /// Session did not complete negotiation in time
    Timeout,
}

/// Payload of a `bye` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByePayload {
    /// Why the sender is ending the session
    pub reason: ByeReason,
}

/// The wire unit exchanged over the signaling channel
///
/// Serializes to `{ "type": ..., "sessionId": ..., "seq": ..., "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Session description offer, originates a negotiation round
    Offer {
        /// Correlates the message to a call session
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Per-session sender-assigned sequence number
        seq: u64,
        /// Offer description
        payload: SessionDescription,
    },
    /// Session description answering an offer
    Answer {
        /// Correlates the message to a call session
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Per-session sender-assigned sequence number
        seq: u64,
        /// Answer description
        payload: SessionDescription,
    },
    /// Network-reachability candidate
    Candidate {
        /// Correlates the message to a call session
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Per-session sender-assigned sequence number
        seq: u64,
        /// Candidate blob
        payload: IceCandidate,
    },
    /// Session teardown notification
    Bye {
        /// Correlates the message to a call session
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Per-session sender-assigned sequence number
        seq: u64,
        /// Teardown reason
        payload: ByePayload,
    },
}

impl SignalingMessage {
    /// Construct an offer message
    pub fn offer(session_id: SessionId, seq: u64, payload: SessionDescription) -> Self {
        Self::Offer {
            session_id,
            seq,
            payload,
        }
    }

    /// Construct an answer message
    pub fn answer(session_id: SessionId, seq: u64, payload: SessionDescription) -> Self {
        Self::Answer {
            session_id,
            seq,
            payload,
        }
    }

    /// Construct a candidate message
    pub fn candidate(session_id: SessionId, seq: u64, payload: IceCandidate) -> Self {
        Self::Candidate {
            session_id,
            seq,
            payload,
        }
    }

    /// Construct a bye message
    pub fn bye(session_id: SessionId, seq: u64, reason: ByeReason) -> Self {
        Self::Bye {
            session_id,
            seq,
            payload: ByePayload { reason },
        }
    }

    /// The session this message belongs to
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::Candidate { session_id, .. }
            | Self::Bye { session_id, .. } => session_id,
        }
    }

    /// Sender-assigned sequence number
    pub fn seq(&self) -> u64 {
        match self {
            Self::Offer { seq, .. }
            | Self::Answer { seq, .. }
            | Self::Candidate { seq, .. }
            | Self::Bye { seq, .. } => *seq,
        }
    }

    /// Wire tag name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Bye { .. } => "bye",
        }
    }

    /// Serialize to the JSON wire form
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire form
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
