//! Configuration types for the signaling core

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the signaling core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket signaling endpoint URL (ws:// or wss://)
    pub endpoint: String,

    /// Bearer token presented during the channel handshake (optional)
    pub auth_token: Option<String>,

    /// Keepalive ping interval in milliseconds (default: 5000)
    pub heartbeat_interval_ms: u64,

    /// Window without any inbound traffic before the channel is declared
    /// stalled, in milliseconds (default: 15000, must exceed the heartbeat
    /// interval)
    pub stall_timeout_ms: u64,

    /// Time a session may spend short of `Connected` before it is failed
    /// with `NegotiationTimeout`, in milliseconds (default: 30000)
    pub negotiation_timeout_ms: u64,

    /// First reconnect backoff delay in milliseconds (default: 500)
    pub reconnect_initial_delay_ms: u64,

    /// Backoff delay ceiling in milliseconds (default: 10000)
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before giving up (default: 5)
    pub reconnect_max_attempts: u32,

    /// Maximum concurrent call sessions, 0 = unlimited (default: 8)
    pub max_sessions: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080".to_string(),
            auth_token: None,
            heartbeat_interval_ms: 5_000,
            stall_timeout_ms: 15_000,
            negotiation_timeout_ms: 30_000,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 10_000,
            reconnect_max_attempts: 5,
            max_sessions: 8,
        }
    }
}

impl SignalingConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `endpoint` is not a WebSocket URL
    /// - `heartbeat_interval_ms` or `negotiation_timeout_ms` is zero
    /// - `stall_timeout_ms` does not exceed `heartbeat_interval_ms`
    /// - `reconnect_initial_delay_ms` is zero or exceeds `reconnect_max_delay_ms`
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "endpoint must start with ws:// or wss://, got {}",
                self.endpoint
            )));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.stall_timeout_ms <= self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "stall_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.stall_timeout_ms, self.heartbeat_interval_ms
            )));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.reconnect_initial_delay_ms == 0
            || self.reconnect_initial_delay_ms > self.reconnect_max_delay_ms
        {
            return Err(Error::InvalidConfig(format!(
                "reconnect_initial_delay_ms ({}) must be non-zero and at most reconnect_max_delay_ms ({})",
                self.reconnect_initial_delay_ms, self.reconnect_max_delay_ms
            )));
        }

        Ok(())
    }

    /// Keepalive ping interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Inbound-traffic stall window
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Per-session negotiation deadline
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Backoff delay for the given reconnect attempt (0-based), doubling
    /// per attempt up to the configured ceiling
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self
            .reconnect_initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }
}
