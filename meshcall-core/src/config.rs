//! Session configuration

use crate::signaling::DEFAULT_MIN_RECEIVE_INTERVAL;
use crate::types::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest stalled-link sweep period; `tokio::time::interval` rejects zero
pub const MIN_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for a call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN/TURN server URLs handed to the connection backend
    pub ice_servers: Vec<String>,
    /// Media acquired when the session starts
    pub constraints: MediaConstraints,
    /// Time a link may spend between sending its description and connecting
    pub negotiation_timeout: Duration,
    /// How often the event loop checks for stalled links
    pub timeout_check_interval: Duration,
    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
    /// Remote candidates buffered per link before the link fails
    pub max_pending_candidates: usize,
    /// Minimum spacing between relay receives (zero disables)
    pub min_receive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            constraints: MediaConstraints::video_call(),
            negotiation_timeout: Duration::from_secs(30),
            timeout_check_interval: Duration::from_secs(1),
            event_capacity: 256,
            max_pending_candidates: 128,
            min_receive_interval: DEFAULT_MIN_RECEIVE_INTERVAL,
        }
    }
}

impl SessionConfig {
    /// Create a builder starting from the defaults
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }
}

/// Builder for [`SessionConfig`]
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ICE server list
    #[must_use]
    pub fn ice_servers(mut self, servers: Vec<String>) -> Self {
        self.config.ice_servers = servers;
        self
    }

    /// Set the media constraints
    #[must_use]
    pub fn constraints(mut self, constraints: MediaConstraints) -> Self {
        self.config.constraints = constraints;
        self
    }

    /// Set the negotiation timeout
    #[must_use]
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    /// Set the stalled-link check interval
    #[must_use]
    pub fn timeout_check_interval(mut self, interval: Duration) -> Self {
        self.config.timeout_check_interval = interval.max(MIN_TIMEOUT_CHECK_INTERVAL);
        self
    }

    /// Set the event channel capacity
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Set the per-link pending candidate bound
    #[must_use]
    pub fn max_pending_candidates(mut self, max: usize) -> Self {
        self.config.max_pending_candidates = max.max(1);
        self
    }

    /// Set the relay receive rate limit
    #[must_use]
    pub fn min_receive_interval(mut self, interval: Duration) -> Self {
        self.config.min_receive_interval = interval;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}
