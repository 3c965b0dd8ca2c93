//! Media engine collaborator interface
//!
//! The signaling core never touches media samples; it only drives an external
//! engine through this seam. Every call is asynchronous and may fail with an
//! engine-specific error, which the negotiator maps to a fatal session
//! failure.

use crate::protocol::{IceCandidate, SessionDescription, SessionId};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Asynchronous interface to the native media engine for one call session
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a local offer description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create a local answer description for a previously applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the local description
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    ///
    /// Callers must never invoke this before [`set_remote_description`]
    /// succeeded; the candidate queue enforces that ordering.
    ///
    /// [`set_remote_description`]: MediaEngine::set_remote_description
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
}

/// Factory producing one [`MediaEngine`] instance per call session
///
/// The supervisor invokes this when an incoming offer creates a callee
/// session; the application invokes it implicitly through `start_call`.
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    /// Create the engine backing a new session
    async fn create_engine(&self, session_id: &SessionId) -> Result<Arc<dyn MediaEngine>>;
}
