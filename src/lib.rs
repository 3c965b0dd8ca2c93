//! WebRTC call signaling over a message relay
//!
//! `rtc_signaling` is the transport-and-negotiation core of a peer-to-peer
//! calling client. It speaks a small JSON protocol (offer, answer, candidate,
//! bye) over a WebSocket relay, drives an external media engine through the
//! [`MediaEngine`] trait, and supervises every concurrent call session
//! multiplexed on one connection.
//!
//! # Architecture
//!
//! ```text
//!            application
//!                 |
//!        ConnectionSupervisor ---- heartbeat / reconnect
//!           |            |
//!     SessionHandle   SignalingChannel <===> relay server
//!           |
//!    SessionNegotiator ---- CandidateQueue
//!           |
//!      MediaEngine (external)
//! ```
//!
//! - [`SignalingChannel`](channel::SignalingChannel) owns the WebSocket and
//!   turns frames into typed [`SignalingMessage`]s.
//! - [`ConnectionSupervisor`](supervisor::ConnectionSupervisor) is the single
//!   fan-out point: it routes inbound messages to sessions, answers incoming
//!   offers, resolves offer glare, enforces negotiation deadlines, and
//!   reconnects with bounded backoff when the transport drops.
//! - Each session runs as its own actor
//!   ([`SessionHandle`](session::SessionHandle)) so messages for one call are
//!   processed strictly in order while unrelated calls proceed in parallel.
//!
//! # Usage
//!
//! ```ignore
//! use rtc_signaling::{ConnectionSupervisor, SignalingConfig};
//!
//! let config = SignalingConfig {
//!     endpoint: "wss://relay.example.com/signal".to_string(),
//!     auth_token: Some(token),
//!     ..Default::default()
//! };
//!
//! let (supervisor, mut events) = ConnectionSupervisor::connect(config, engines).await?;
//! let session_id = supervisor.start_call().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("session {} is now {:?}", event.session_id, event.state);
//! }
//! ```
//!
//! Session identifiers are single-use: once a session ends for any reason its
//! identifier is retired and a new call needs a fresh one.

#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod supervisor;

pub use channel::{ChannelEvent, SignalingChannel};
pub use config::SignalingConfig;
pub use engine::{MediaEngine, MediaEngineFactory};
pub use error::{Error, Result};
pub use protocol::{
    ByePayload, ByeReason, IceCandidate, SdpKind, SessionDescription, SessionId, SignalingMessage,
};
pub use session::{
    ConnectionState, Role, SessionEndReason, SessionEvent, SessionHandle,
};
pub use supervisor::ConnectionSupervisor;

/// Library version string
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
