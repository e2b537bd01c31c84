//! Timing configuration for election, polling and presence.
//!
//! The defaults are the values observed in production (30s heartbeat
//! against a 120s server TTL). None of them are load-bearing constants;
//! [`SyncConfig::validate`] only enforces the ratios the protocols need.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ─── Defaults ─────────────────────────────────────────────────────

pub const DEFAULT_ANNOUNCE_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SILENCE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SETTLE_MS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_PRESENCE_TTL_MS: u64 = 120_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10_000;

// ─── Sections ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// How often a tab re-announces its claim.
    pub announce_interval_ms: u64,
    /// A peer not heard from for this long is considered gone.
    pub silence_timeout_ms: u64,
    /// Initial window during which a new tab only listens.
    pub settle_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            silence_timeout_ms: DEFAULT_SILENCE_TIMEOUT_MS,
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub default_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    /// Server-side expiry of an entry without heartbeats.
    pub ttl_ms: u64,
    /// How often the loopback hub sweeps expired entries.
    pub sweep_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            ttl_ms: DEFAULT_PRESENCE_TTL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

// ─── SyncConfig ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub leader: LeaderConfig,
    pub polling: PollingConfig,
    pub presence: PresenceConfig,
}

impl SyncConfig {
    /// Parse a JSON document; missing fields fall back to defaults.
    ///
    /// Not validated: callers layer their overrides on top first, then
    /// call [`validate`](Self::validate).
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let nonzero = [
            ("leader.announce_interval_ms", self.leader.announce_interval_ms),
            ("leader.silence_timeout_ms", self.leader.silence_timeout_ms),
            ("polling.default_interval_ms", self.polling.default_interval_ms),
            ("presence.heartbeat_interval_ms", self.presence.heartbeat_interval_ms),
            ("presence.ttl_ms", self.presence.ttl_ms),
            ("presence.sweep_interval_ms", self.presence.sweep_interval_ms),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::InvalidConfig(format!("{name} must be > 0")));
        }

        if self.leader.silence_timeout_ms <= self.leader.announce_interval_ms {
            return Err(SyncError::InvalidConfig(format!(
                "leader.silence_timeout_ms ({}) must exceed leader.announce_interval_ms ({})",
                self.leader.silence_timeout_ms, self.leader.announce_interval_ms
            )));
        }

        // At least two heartbeats must fit in one TTL window.
        if self.presence.heartbeat_interval_ms >= self.presence.ttl_ms / 2 {
            return Err(SyncError::InvalidConfig(format!(
                "presence.heartbeat_interval_ms ({}) must be below half of presence.ttl_ms ({})",
                self.presence.heartbeat_interval_ms, self.presence.ttl_ms
            )));
        }

        Ok(())
    }
}
