//! Tunables of the session layer.
//!
//! Values are supplied by whatever loads the server configuration; the
//! defaults below match what Linux clients expect from a general purpose
//! server. `max_connections_per_session` and slot table targets can also be
//! adjusted at runtime through [`crate::session::SessionManager`].

use std::time::Duration;

/// Server side maximums for one channel. Client requests are clamped to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub max_request_size: u32,
    pub max_response_size: u32,
    pub max_response_size_cached: u32,
    pub max_operations: u32,
    /// Upper bound for the number of slots in the channel's slot table.
    pub max_slots: u32,
}

impl ChannelLimits {
    /// Limits for the fore channel: 1 MiB of payload plus room for headers.
    pub const fn fore() -> Self {
        Self {
            max_request_size: 1024 * 1024 + 1024,
            max_response_size: 1024 * 1024 + 1024,
            max_response_size_cached: 64 * 1024,
            max_operations: 16,
            max_slots: 64,
        }
    }

    /// Limits for the back channel, which only carries small callbacks.
    pub const fn back() -> Self {
        Self {
            max_request_size: 16 * 1024,
            max_response_size: 16 * 1024,
            max_response_size_cached: 4 * 1024,
            max_operations: 8,
            max_slots: 16,
        }
    }
}

/// Configuration of a [`crate::session::SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of connections bound to one session.
    pub max_connections_per_session: usize,
    /// How long a client keeps its state without sending a sequenced request.
    pub lease_time: Duration,
    /// Length of the reclaim window after server start.
    pub grace_period: Duration,
    /// Period of the lease expiry sweep.
    pub reaper_interval: Duration,
    pub fore_channel_limits: ChannelLimits,
    pub back_channel_limits: ChannelLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections_per_session: 16,
            lease_time: Duration::from_secs(90),
            grace_period: Duration::from_secs(90),
            reaper_interval: Duration::from_secs(30),
            fore_channel_limits: ChannelLimits::fore(),
            back_channel_limits: ChannelLimits::back(),
        }
    }
}

impl SessionConfig {
    pub fn with_max_connections_per_session(mut self, limit: usize) -> Self {
        self.max_connections_per_session = limit;
        self
    }

    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_fore_channel_limits(mut self, limits: ChannelLimits) -> Self {
        self.fore_channel_limits = limits;
        self
    }

    pub fn with_back_channel_limits(mut self, limits: ChannelLimits) -> Self {
        self.back_channel_limits = limits;
        self
    }
}
