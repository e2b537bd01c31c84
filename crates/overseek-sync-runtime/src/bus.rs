//! Tab-to-tab broadcast bus.
//!
//! A named channel reaches every other handle opened on the same name in
//! the same process. Like a browser `BroadcastChannel`, a handle never
//! receives its own posts. Frames travel as JSON text so the decode path
//! is the same one a real cross-process transport would take.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use overseek_sync_core::SyncError;
use overseek_sync_core::envelope::BusMessage;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::lock;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct BusFrame {
    sender: u64,
    body: Arc<str>,
}

// ─── Trait ────────────────────────────────────────────────────────

pub trait BroadcastBus: Send + Sync {
    /// Open a handle on `name`. Fails when the environment has no bus.
    fn open(&self, name: &str) -> Result<BusChannel, SyncError>;
}

// ─── Handles ──────────────────────────────────────────────────────

/// Send half of a [`BusChannel`], cheap to clone and usable from `Drop`.
#[derive(Debug, Clone)]
pub struct BusPoster {
    name: String,
    handle_id: u64,
    tx: broadcast::Sender<BusFrame>,
}

impl BusPoster {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every other handle on this channel.
    pub fn post(&self, msg: &BusMessage) -> Result<(), SyncError> {
        let body = msg.encode()?;
        // No receivers just means nobody else is listening.
        let _ = self.tx.send(BusFrame {
            sender: self.handle_id,
            body: body.into(),
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct BusChannel {
    poster: BusPoster,
    rx: broadcast::Receiver<BusFrame>,
}

impl BusChannel {
    pub fn name(&self) -> &str {
        self.poster.name()
    }

    pub fn poster(&self) -> BusPoster {
        self.poster.clone()
    }

    pub fn post(&self, msg: &BusMessage) -> Result<(), SyncError> {
        self.poster.post(msg)
    }

    /// Next message from another handle. `None` once the bus is gone.
    ///
    /// Undecodable frames are logged and skipped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.sender == self.poster.handle_id => continue,
                Ok(frame) => match BusMessage::decode(&frame.body) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        debug!(channel = %self.poster.name, error = %e, "bus: dropping malformed frame");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.poster.name, skipped, "bus: receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ─── LocalBus ─────────────────────────────────────────────────────

/// In-process bus: every tab in this process shares one `LocalBus`.
#[derive(Debug)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusFrame>>>,
    next_handle: AtomicU64,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Names with at least one open handle.
    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.channels)
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl BroadcastBus for LocalBus {
    fn open(&self, name: &str) -> Result<BusChannel, SyncError> {
        let mut channels = lock(&self.channels);
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let rx = tx.subscribe();
        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        Ok(BusChannel {
            poster: BusPoster {
                name: name.to_string(),
                handle_id,
                tx,
            },
            rx,
        })
    }
}

// ─── UnsupportedBus ───────────────────────────────────────────────

/// Environment without a broadcast primitive. Every open fails, which
/// makes each tab lead on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBus;

impl BroadcastBus for UnsupportedBus {
    fn open(&self, name: &str) -> Result<BusChannel, SyncError> {
        Err(SyncError::BusUnavailable(format!(
            "no broadcast bus for channel {name}"
        )))
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    fn announce(tab: &str) -> BusMessage {
        BusMessage::LeaderAnnounce {
            tab_id: tab.into(),
            claimed_at: 1,
        }
    }

    #[tokio::test]
    async fn reaches_other_handles_but_not_self() {
        let bus = LocalBus::new();
        let mut a = bus.open("polling-x").expect("open");
        let mut b = bus.open("polling-x").expect("open");

        a.post(&announce("a")).expect("post");
        assert_eq!(b.recv().await, Some(announce("a")));

        let own = timeout(Duration::from_millis(20), a.recv()).await;
        assert!(own.is_err(), "sender must not see its own post");
    }

    #[tokio::test]
    async fn channels_are_isolated_by_name() {
        let bus = LocalBus::new();
        let a = bus.open("one").expect("open");
        let mut b = bus.open("two").expect("open");
        a.post(&announce("a")).expect("post");
        assert!(timeout(Duration::from_millis(20), b.recv()).await.is_err());
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let bus = LocalBus::new();
        let a = bus.open("c").expect("open");
        let mut b = bus.open("c").expect("open");
        let _ = a.poster.tx.send(BusFrame {
            sender: a.poster.handle_id,
            body: "not json".into(),
        });
        a.post(&announce("a")).expect("post");
        assert_eq!(b.recv().await, Some(announce("a")));
    }

    #[tokio::test]
    async fn closed_channels_are_pruned_on_open() {
        let bus = LocalBus::new();
        let a = bus.open("gone").expect("open");
        assert_eq!(bus.open_channels(), vec!["gone"]);
        drop(a);
        let _b = bus.open("kept").expect("open");
        assert_eq!(bus.open_channels(), vec!["kept"]);
    }

    #[test]
    fn unsupported_bus_refuses() {
        let err = UnsupportedBus.open("x").expect_err("must fail");
        assert!(matches!(err, SyncError::BusUnavailable(_)));
    }
}
