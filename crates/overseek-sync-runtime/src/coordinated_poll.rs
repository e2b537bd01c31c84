//! Leader-only polling with cross-tab fan-out.
//!
//! One [`CoordinatedPoll`] runs per channel per tab. Its task fetches on a
//! fixed interval only while the tab leads `polling-<channel>` and is
//! visible, delivers the payload locally and posts it on `data-<channel>`
//! for the other tabs. Followers never fetch; they deliver what arrives on
//! the data channel. Several subscribers in one tab share the loop through
//! [`PollSubscription`] handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use overseek_sync_core::envelope::{BusMessage, decode_data};
use overseek_sync_core::polling::{PollGate, PollingChannelState};
use overseek_sync_core::types::polling_data_channel;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivitySignal;
use crate::bus::{BroadcastBus, BusChannel};
use crate::clock;
use crate::lock;
use crate::tab_leader::TabLeader;

/// Payload types a poll can carry.
pub trait PollPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> PollPayload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

type DataCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Shared<T> {
    channel_name: String,
    state: Mutex<PollingChannelState<T>>,
    subscribers: Mutex<Vec<(u64, DataCallback<T>)>>,
    next_subscriber: AtomicU64,
    fetch_count: AtomicU64,
}

impl<T: Clone> Shared<T> {
    fn deliver(&self, payload: &T) {
        let callbacks: Vec<DataCallback<T>> = lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(payload);
        }
    }
}

// ─── CoordinatedPoll ──────────────────────────────────────────────

pub struct CoordinatedPoll<T> {
    shared: Arc<Shared<T>>,
    leader: Arc<TabLeader>,
    restart: Arc<Notify>,
    cancel: CancellationToken,
}

impl<T> fmt::Debug for CoordinatedPoll<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatedPoll")
            .field("channel_name", &self.shared.channel_name)
            .field("tab_id", &self.leader.tab_id())
            .finish_non_exhaustive()
    }
}

impl<T: PollPayload> CoordinatedPoll<T> {
    /// Start the loop for `channel_name`.
    ///
    /// `leader` must be the tab's leader for `polling-<channel_name>`. The
    /// first fetch happens right away if this tab already leads; otherwise
    /// the tab waits for data from the leader.
    pub fn spawn<F, Fut, E>(
        bus: &dyn BroadcastBus,
        leader: Arc<TabLeader>,
        activity: &dyn ActivitySignal,
        channel_name: &str,
        interval: Duration,
        fetch: F,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let cancel = cancel.child_token();
        let interval = interval.max(Duration::from_millis(1));
        let data = match bus.open(&polling_data_channel(channel_name)) {
            Ok(channel) => Some(channel),
            Err(e) => {
                debug!(channel = %channel_name, error = %e, "poll: no data channel, fetching locally");
                None
            }
        };
        let shared = Arc::new(Shared {
            channel_name: channel_name.to_string(),
            state: Mutex::new(PollingChannelState::new(
                channel_name,
                interval.as_millis() as u64,
            )),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            fetch_count: AtomicU64::new(0),
        });
        let restart = Arc::new(Notify::new());

        let task = PollTask {
            shared: Arc::clone(&shared),
            fetch,
            data,
            leader_rx: leader.subscribe(),
            activity_rx: activity.subscribe(),
            restart: Arc::clone(&restart),
            cancel: cancel.clone(),
            interval,
        };
        tokio::spawn(task.run());
        info!(channel = %channel_name, tab_id = %leader.tab_id(), interval_ms = interval.as_millis() as u64, "poll: started");

        Arc::new(Self {
            shared,
            leader,
            restart,
            cancel,
        })
    }

    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Latest payload seen by this tab, fetched or received.
    pub fn latest(&self) -> Option<T> {
        lock(&self.shared.state).last_payload.clone()
    }

    /// Number of fetches this tab has completed.
    pub fn fetch_count(&self) -> u64 {
        self.shared.fetch_count.load(Ordering::Relaxed)
    }

    /// Tear down and re-arm the loop: the timer restarts and a leader
    /// fetches immediately, exactly as on first mount.
    pub fn restart(&self) {
        self.restart.notify_one();
    }

    /// Register `on_data`; it runs for every payload this tab delivers.
    pub fn subscribe(
        self: &Arc<Self>,
        on_data: impl Fn(&T) + Send + Sync + 'static,
    ) -> PollSubscription<T> {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).push((id, Arc::new(on_data)));
        PollSubscription {
            poll: Arc::clone(self),
            id,
        }
    }
}

impl<T> Drop for CoordinatedPoll<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        debug!(channel = %self.shared.channel_name, "poll: stopped");
    }
}

// ─── PollSubscription ─────────────────────────────────────────────

/// One subscriber's share of a poll. Dropping the last one stops the loop.
pub struct PollSubscription<T> {
    poll: Arc<CoordinatedPoll<T>>,
    id: u64,
}

impl<T> fmt::Debug for PollSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSubscription")
            .field("channel_name", &self.poll.shared.channel_name)
            .field("id", &self.id)
            .finish()
    }
}

impl<T> std::ops::Deref for PollSubscription<T> {
    type Target = CoordinatedPoll<T>;

    fn deref(&self) -> &Self::Target {
        &self.poll
    }
}

impl<T> Drop for PollSubscription<T> {
    fn drop(&mut self) {
        lock(&self.poll.shared.subscribers).retain(|(id, _)| *id != self.id);
    }
}

// ─── Task ─────────────────────────────────────────────────────────

struct PollTask<T, F> {
    shared: Arc<Shared<T>>,
    fetch: F,
    data: Option<BusChannel>,
    leader_rx: watch::Receiver<bool>,
    activity_rx: watch::Receiver<bool>,
    restart: Arc<Notify>,
    cancel: CancellationToken,
    interval: Duration,
}

async fn recv_data(data: &mut Option<BusChannel>) -> Option<BusMessage> {
    match data {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

impl<T, F, Fut, E> PollTask<T, F>
where
    T: PollPayload,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    async fn run(mut self) {
        let channel = self.shared.channel_name.clone();
        let mut gate = PollGate::new(
            *self.leader_rx.borrow_and_update(),
            *self.activity_rx.borrow_and_update(),
        );
        let mut leader_open = true;
        let mut activity_open = true;

        // First tick completes immediately: that is the mount fetch.
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let fetch_now = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                changed = self.leader_rx.changed(), if leader_open => match changed {
                    Ok(()) => {
                        let leader = *self.leader_rx.borrow_and_update();
                        let stale = lock(&self.shared.state).is_stale(clock::now_ms());
                        debug!(channel = %channel, leader, stale, "poll: leadership changed");
                        gate.set_leader(leader, stale)
                    }
                    Err(_) => {
                        leader_open = false;
                        gate.set_leader(false, false)
                    }
                },
                changed = self.activity_rx.changed(), if activity_open => match changed {
                    Ok(()) => {
                        let active = *self.activity_rx.borrow_and_update();
                        gate.set_active(active)
                    }
                    Err(_) => {
                        activity_open = false;
                        false
                    }
                },
                () = self.restart.notified() => {
                    ticker.reset();
                    gate.may_fetch()
                }
                msg = recv_data(&mut self.data) => {
                    match msg {
                        Some(msg) => self.accept(&msg),
                        None => {
                            warn!(channel = %channel, "poll: data channel closed");
                            self.data = None;
                        }
                    }
                    false
                }
                _ = ticker.tick() => gate.may_fetch(),
            };

            if fetch_now && !self.fetch_once().await {
                break;
            }
        }
        debug!(channel = %channel, "poll: loop exited");
    }

    /// Returns `false` when cancelled mid-fetch.
    async fn fetch_once(&mut self) -> bool {
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            result = (self.fetch)() => result,
        };
        let payload = match result {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %self.shared.channel_name, error = %e, "poll: fetch failed");
                return true;
            }
        };
        if self.cancel.is_cancelled() {
            return false;
        }

        let now = clock::now_ms();
        self.shared.fetch_count.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.state).record_fetch(payload.clone(), now);
        if let Some(data) = &self.data {
            match BusMessage::data(&self.shared.channel_name, &payload, now) {
                Ok(msg) => {
                    if let Err(e) = data.post(&msg) {
                        warn!(channel = %self.shared.channel_name, error = %e, "poll: broadcast failed");
                    }
                }
                Err(e) => {
                    warn!(channel = %self.shared.channel_name, error = %e, "poll: payload not serializable");
                }
            }
        }
        self.shared.deliver(&payload);
        true
    }

    fn accept(&self, msg: &BusMessage) {
        match decode_data::<T>(msg, &self.shared.channel_name) {
            Ok(Some((payload, timestamp))) => {
                let accepted = lock(&self.shared.state).accept_broadcast(payload.clone(), timestamp);
                if accepted && !self.cancel.is_cancelled() {
                    self.shared.deliver(&payload);
                } else if !accepted {
                    debug!(channel = %self.shared.channel_name, timestamp, "poll: dropped older broadcast");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(channel = %self.shared.channel_name, error = %e, "poll: undecodable payload");
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
