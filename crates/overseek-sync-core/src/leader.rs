//! Cross-tab leader election state machine.
//!
//! Every tab taking part in a channel key announces `(tab_id, claimed_at)`
//! on the bus at a fixed interval. The oldest claim wins; equal claims are
//! ordered by `tab_id`, which makes the order total. A tab leads when its
//! settle window has passed and no live peer outranks it. Peers silent for
//! longer than `silence_timeout_ms` are forgotten, which is how a crashed
//! leader gets replaced. Brief windows with zero or two leaders during
//! startup and takeover are accepted.
//!
//! Pure and deterministic: the caller owns the clock and the bus.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::LeaderConfig;
use crate::envelope::BusMessage;

// ─── Types ────────────────────────────────────────────────────────

/// Snapshot of one tab's claim on a channel key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipClaim {
    pub channel_key: String,
    pub tab_id: String,
    pub claimed_at_ms: u64,
    pub is_leader: bool,
}

/// Last announcement seen from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerClaim {
    pub claimed_at_ms: u64,
    pub last_seen_ms: u64,
}

/// Result of [`LeaderElection::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderTransition {
    pub is_leader: bool,
    pub changed: bool,
    /// Peers dropped in this evaluation for being silent too long.
    pub expired: Vec<String>,
}

// ─── Ordering ─────────────────────────────────────────────────────

/// `Less` means `a` outranks `b`.
fn rank(a: (u64, &str), b: (u64, &str)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

// ─── LeaderElection ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LeaderElection {
    channel_key: String,
    tab_id: String,
    claimed_at_ms: u64,
    config: LeaderConfig,
    peers: HashMap<String, PeerClaim>,
    is_leader: bool,
    last_announce_ms: Option<u64>,
}

impl LeaderElection {
    pub fn new(
        channel_key: impl Into<String>,
        tab_id: impl Into<String>,
        now_ms: u64,
        config: LeaderConfig,
    ) -> Self {
        Self {
            channel_key: channel_key.into(),
            tab_id: tab_id.into(),
            claimed_at_ms: now_ms,
            config,
            peers: HashMap::new(),
            is_leader: false,
            last_announce_ms: None,
        }
    }

    pub fn channel_key(&self) -> &str {
        &self.channel_key
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn claim(&self) -> LeadershipClaim {
        LeadershipClaim {
            channel_key: self.channel_key.clone(),
            tab_id: self.tab_id.clone(),
            claimed_at_ms: self.claimed_at_ms,
            is_leader: self.is_leader,
        }
    }

    /// Peer ids currently considered alive, sorted.
    pub fn live_peers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.peers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Build an announcement and remember when it was sent.
    pub fn announcement(&mut self, now_ms: u64) -> BusMessage {
        self.last_announce_ms = Some(now_ms);
        BusMessage::LeaderAnnounce {
            tab_id: self.tab_id.clone(),
            claimed_at: self.claimed_at_ms,
        }
    }

    /// Whether the announce interval has elapsed since the last announcement.
    pub fn announce_due(&self, now_ms: u64) -> bool {
        match self.last_announce_ms {
            None => true,
            Some(at) => now_ms >= at.saturating_add(self.config.announce_interval_ms),
        }
    }

    /// Message sent when this tab gives up its claim.
    pub fn abdication(&mut self) -> BusMessage {
        self.is_leader = false;
        BusMessage::LeaderAbdicate {
            tab_id: self.tab_id.clone(),
        }
    }

    /// Feed an inbound bus message.
    ///
    /// Returns an announcement to send back when the message came from a
    /// peer this tab had not heard from, so newcomers learn about existing
    /// claims without waiting for the next interval.
    pub fn observe(&mut self, msg: &BusMessage, now_ms: u64) -> Option<BusMessage> {
        match msg {
            BusMessage::LeaderAnnounce { tab_id, claimed_at } => {
                if *tab_id == self.tab_id {
                    return None;
                }
                let is_new = self
                    .peers
                    .insert(
                        tab_id.clone(),
                        PeerClaim {
                            claimed_at_ms: *claimed_at,
                            last_seen_ms: now_ms,
                        },
                    )
                    .is_none();
                is_new.then(|| self.announcement(now_ms))
            }
            BusMessage::LeaderAbdicate { tab_id } => {
                self.peers.remove(tab_id);
                None
            }
            BusMessage::Data { .. } => None,
        }
    }

    /// Drop silent peers and recompute leadership.
    pub fn evaluate(&mut self, now_ms: u64) -> LeaderTransition {
        let silence = self.config.silence_timeout_ms;
        let mut expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.last_seen_ms) > silence)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.peers.remove(id);
        }

        let settled = now_ms >= self.claimed_at_ms.saturating_add(self.config.settle_ms);
        let me = (self.claimed_at_ms, self.tab_id.as_str());
        let outranked = self
            .peers
            .iter()
            .any(|(id, p)| rank((p.claimed_at_ms, id.as_str()), me) == Ordering::Less);

        let is_leader = settled && !outranked;
        let changed = is_leader != self.is_leader;
        self.is_leader = is_leader;

        LeaderTransition {
            is_leader,
            changed,
            expired,
        }
    }

    /// Earliest time at which announcing or re-evaluating can change anything.
    pub fn next_deadline_ms(&self, now_ms: u64) -> u64 {
        let mut deadline = match self.last_announce_ms {
            None => now_ms,
            Some(at) => at.saturating_add(self.config.announce_interval_ms),
        };

        let settle_end = self.claimed_at_ms.saturating_add(self.config.settle_ms);
        if settle_end > now_ms {
            deadline = deadline.min(settle_end);
        }

        for peer in self.peers.values() {
            let expiry = peer
                .last_seen_ms
                .saturating_add(self.config.silence_timeout_ms)
                .saturating_add(1);
            deadline = deadline.min(expiry);
        }

        deadline.max(now_ms)
    }
}

// ─── Tests ────────────────────────────────────────────────────────
