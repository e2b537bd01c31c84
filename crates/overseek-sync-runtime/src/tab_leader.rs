//! Runs a [`LeaderElection`] for one channel key on the broadcast bus.
//!
//! The election task sleeps until the state machine's next deadline or the
//! next bus message, whichever comes first. Leadership is published on a
//! `watch` channel. Dropping the [`TabLeader`] abdicates synchronously so
//! peers can take over without waiting for the silence timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use overseek_sync_core::config::LeaderConfig;
use overseek_sync_core::envelope::BusMessage;
use overseek_sync_core::leader::LeaderElection;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BroadcastBus, BusChannel, BusPoster};
use crate::clock;

#[derive(Debug)]
enum Mode {
    Elected {
        cancel: CancellationToken,
        release: Release,
    },
    /// No bus: this tab leads on its own.
    Solo { _tx: watch::Sender<bool> },
}

/// Posts the abdication exactly once, from whichever side shuts down first.
#[derive(Debug, Clone)]
struct Release {
    poster: BusPoster,
    tab_id: String,
    done: Arc<AtomicBool>,
}

impl Release {
    fn abdicate(&self, election: Option<&mut LeaderElection>) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let msg = match election {
            Some(e) => e.abdication(),
            None => BusMessage::LeaderAbdicate {
                tab_id: self.tab_id.clone(),
            },
        };
        if let Err(e) = self.poster.post(&msg) {
            warn!(channel = %self.poster.name(), error = %e, "leader: abdication not sent");
        }
    }
}

#[derive(Debug)]
pub struct TabLeader {
    channel_key: String,
    tab_id: String,
    rx: watch::Receiver<bool>,
    mode: Mode,
}

impl TabLeader {
    /// Start taking part in the election for `channel_key`.
    ///
    /// Must be called inside a tokio runtime. `cancel` stops the election
    /// (and abdicates) without dropping the handle.
    pub fn spawn(
        bus: &dyn BroadcastBus,
        channel_key: &str,
        tab_id: &str,
        config: LeaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let channel = match bus.open(channel_key) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(channel = %channel_key, tab_id = %tab_id, error = %e, "leader: bus unavailable, leading alone");
                let (tx, rx) = watch::channel(true);
                return Self {
                    channel_key: channel_key.to_string(),
                    tab_id: tab_id.to_string(),
                    rx,
                    mode: Mode::Solo { _tx: tx },
                };
            }
        };

        let (tx, rx) = watch::channel(false);
        let release = Release {
            poster: channel.poster(),
            tab_id: tab_id.to_string(),
            done: Arc::new(AtomicBool::new(false)),
        };
        let election = LeaderElection::new(channel_key, tab_id, clock::now_ms(), config);
        tokio::spawn(run_election(
            election,
            channel,
            tx,
            release.clone(),
            cancel.clone(),
        ));

        Self {
            channel_key: channel_key.to_string(),
            tab_id: tab_id.to_string(),
            rx,
            mode: Mode::Elected { cancel, release },
        }
    }

    pub fn channel_key(&self) -> &str {
        &self.channel_key
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// Whether an election is running (false when the bus was unavailable).
    pub fn is_coordinated(&self) -> bool {
        matches!(self.mode, Mode::Elected { .. })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

impl Drop for TabLeader {
    fn drop(&mut self) {
        if let Mode::Elected { cancel, release } = &self.mode {
            cancel.cancel();
            release.abdicate(None);
            debug!(channel = %self.channel_key, tab_id = %self.tab_id, "leader: released");
        }
    }
}

// ─── Election task ────────────────────────────────────────────────

async fn run_election(
    mut election: LeaderElection,
    mut channel: BusChannel,
    tx: watch::Sender<bool>,
    release: Release,
    cancel: CancellationToken,
) {
    debug!(channel = %election.channel_key(), tab_id = %election.tab_id(), "leader: election started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let now = clock::now_ms();
        if election.announce_due(now) {
            post(&channel, &election.announcement(now));
        }
        let transition = election.evaluate(now);
        for peer in &transition.expired {
            debug!(channel = %election.channel_key(), peer = %peer, "leader: peer went silent");
        }
        if transition.changed {
            info!(
                channel = %election.channel_key(),
                tab_id = %election.tab_id(),
                is_leader = transition.is_leader,
                "leader: role changed"
            );
            tx.send_replace(transition.is_leader);
        }

        let deadline = clock::instant_at(election.next_deadline_ms(now));
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = channel.recv() => match msg {
                Some(msg) => {
                    if let Some(reply) = election.observe(&msg, clock::now_ms()) {
                        post(&channel, &reply);
                    }
                }
                None => {
                    warn!(channel = %election.channel_key(), "leader: bus closed");
                    break;
                }
            },
            () = tokio::time::sleep_until(deadline) => {}
        }
    }

    release.abdicate(Some(&mut election));
    tx.send_replace(false);
}

fn post(channel: &BusChannel, msg: &BusMessage) {
    if let Err(e) = channel.post(msg) {
        warn!(channel = %channel.name(), error = %e, "leader: post failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, UnsupportedBus};
    use tokio::time::{Duration, advance};

    fn config() -> LeaderConfig {
        LeaderConfig {
            announce_interval_ms: 1_000,
            silence_timeout_ms: 3_000,
            settle_ms: 100,
        }
    }

    async fn settle(ms: u64) {
        for _ in 0..ms / 50 {
            advance(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lone_tab_becomes_leader_after_settle() {
        let bus = LocalBus::new();
        let leader = TabLeader::spawn(&bus, "k", "tab-a", config(), CancellationToken::new());
        assert!(!leader.is_leader());
        settle(200).await;
        assert!(leader.is_leader());
        assert!(leader.is_coordinated());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_bus_leads_alone() {
        let leader = TabLeader::spawn(
            &UnsupportedBus,
            "k",
            "tab-a",
            config(),
            CancellationToken::new(),
        );
        assert!(leader.is_leader());
        assert!(!leader.is_coordinated());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_posts_abdication() {
        let bus = LocalBus::new();
        let mut spy = bus.open("k").expect("open");
        let leader = TabLeader::spawn(&bus, "k", "tab-a", config(), CancellationToken::new());
        settle(200).await;
        drop(leader);

        let mut saw_abdicate = 0;
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(10), spy.recv()).await
        {
            if matches!(msg, BusMessage::LeaderAbdicate { .. }) {
                saw_abdicate += 1;
            }
        }
        assert_eq!(saw_abdicate, 1, "abdication sent exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_token_stops_election() {
        let bus = LocalBus::new();
        let cancel = CancellationToken::new();
        let leader = TabLeader::spawn(&bus, "k", "tab-a", config(), cancel.clone());
        settle(200).await;
        assert!(leader.is_leader());
        cancel.cancel();
        settle(100).await;
        assert!(!leader.is_leader());
    }
}
