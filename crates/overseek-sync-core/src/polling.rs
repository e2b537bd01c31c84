//! Coordinated polling: local payload cache and the fetch gate.
//!
//! Only the tab leading `polling-<channel>` while active may fetch. The gate
//! turns leadership and activity changes into "fetch now" decisions; the
//! channel state keeps the freshest payload this tab has seen.

/// Local copy of one polling channel's data.
#[derive(Debug, Clone, PartialEq)]
pub struct PollingChannelState<T> {
    pub channel_name: String,
    pub interval_ms: u64,
    pub last_payload: Option<T>,
    pub last_fetched_at_ms: Option<u64>,
}

impl<T> PollingChannelState<T> {
    pub fn new(channel_name: impl Into<String>, interval_ms: u64) -> Self {
        Self {
            channel_name: channel_name.into(),
            interval_ms,
            last_payload: None,
            last_fetched_at_ms: None,
        }
    }

    /// Record a payload fetched by this tab.
    pub fn record_fetch(&mut self, payload: T, now_ms: u64) {
        self.last_payload = Some(payload);
        self.last_fetched_at_ms = Some(now_ms);
    }

    /// Record a payload received from another tab.
    ///
    /// Returns `false` (and keeps the current copy) when the payload is
    /// older than what this tab already holds.
    pub fn accept_broadcast(&mut self, payload: T, timestamp: u64) -> bool {
        if self.last_fetched_at_ms.is_some_and(|at| timestamp < at) {
            return false;
        }
        self.last_payload = Some(payload);
        self.last_fetched_at_ms = Some(timestamp);
        true
    }

    /// No payload yet, or the last one is at least one interval old.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        match self.last_fetched_at_ms {
            None => true,
            Some(at) => now_ms.saturating_sub(at) >= self.interval_ms,
        }
    }
}

/// Decides when the local tab fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollGate {
    is_leader: bool,
    is_active: bool,
}

impl PollGate {
    pub fn new(is_leader: bool, is_active: bool) -> Self {
        Self {
            is_leader,
            is_active,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Scheduled ticks (and mount / restart) fetch only as active leader.
    #[must_use]
    pub fn may_fetch(&self) -> bool {
        self.is_leader && self.is_active
    }

    /// Returns `true` when becoming active as leader calls for an
    /// immediate fetch.
    #[must_use]
    pub fn set_active(&mut self, active: bool) -> bool {
        let resumed = active && !self.is_active;
        self.is_active = active;
        resumed && self.is_leader
    }

    /// Returns `true` when gaining leadership with stale data calls for an
    /// immediate fetch.
    #[must_use]
    pub fn set_leader(&mut self, leader: bool, data_is_stale: bool) -> bool {
        let gained = leader && !self.is_leader;
        self.is_leader = leader;
        gained && self.is_active && data_is_stale
    }
}
