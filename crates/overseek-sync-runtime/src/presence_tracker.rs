//! Drives a [`PresenceSession`] over a realtime channel.
//!
//! The handle applies resource and user changes synchronously; the task
//! feeds in connectivity, visibility, heartbeat ticks and server syncs.
//! Both sides run the session's commands through the same path and emit
//! while still holding the session, so every emit reaches the channel in
//! the order the state machine produced it. Dropping the tracker emits the
//! leave before returning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use overseek_sync_core::config::PresenceConfig;
use overseek_sync_core::envelope::{ServerEvent, WireFrame};
use overseek_sync_core::presence::{PresenceCommand, PresenceSession, PresenceState};
use overseek_sync_core::roster::PresenceView;
use overseek_sync_core::types::{ColorSource, ResourceKind, UserIdentity};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivitySignal;
use crate::clock;
use crate::lock;
use crate::realtime::RealtimeChannel;

struct Shared {
    session: Mutex<PresenceSession>,
    channel: Arc<dyn RealtimeChannel>,
    view_tx: watch::Sender<PresenceView>,
    /// Wakes the task to re-check whether the heartbeat timer should run.
    wake: Notify,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut PresenceSession) -> Vec<PresenceCommand>) {
        let mut session = lock(&self.session);
        for cmd in f(&mut session) {
            match cmd {
                PresenceCommand::Emit(event) => {
                    if let Err(e) = self.channel.emit(event.to_wire()) {
                        debug!(event = event.name(), error = %e, "presence: emit skipped");
                    }
                }
                PresenceCommand::StartHeartbeat | PresenceCommand::StopHeartbeat => {
                    self.wake.notify_one();
                }
                PresenceCommand::RosterChanged => {}
            }
        }
        let view = session.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }
}

// ─── PresenceTracker ──────────────────────────────────────────────

pub struct PresenceTracker {
    kind: ResourceKind,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PresenceTracker {
    /// Start tracking `kind` rooms on `channel`. Nothing is joined until
    /// both a resource and a user are set.
    pub fn spawn(
        kind: ResourceKind,
        channel: Arc<dyn RealtimeChannel>,
        activity: &dyn ActivitySignal,
        colors: Box<dyn ColorSource>,
        config: &PresenceConfig,
        cancel: CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        // The server may expire an entry whose last heartbeat went out one
        // interval before the tab was hidden.
        let rejoin_after = config.ttl_ms.saturating_sub(config.heartbeat_interval_ms);
        let mut session = PresenceSession::new(kind, colors).with_rejoin_after(rejoin_after);
        session.set_connected(channel.is_connected());
        session.set_active(activity.is_active(), clock::now_ms());

        let shared = Arc::new(Shared {
            view_tx: watch::Sender::new(session.view()),
            session: Mutex::new(session),
            channel: Arc::clone(&channel),
            wake: Notify::new(),
        });

        let task = TrackerTask {
            shared: Arc::clone(&shared),
            connection: channel.connection(),
            activity: activity.subscribe(),
            events: channel.subscribe(),
            heartbeat_every: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Self {
            kind,
            shared,
            cancel,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn state(&self) -> PresenceState {
        lock(&self.shared.session).state()
    }

    /// `None` or an empty id stops tracking.
    pub fn set_resource(&self, resource_id: Option<String>) {
        self.shared.update(|s| s.set_resource(resource_id));
    }

    pub fn set_user(&self, user: Option<UserIdentity>) {
        self.shared.update(|s| s.set_user(user));
    }

    pub fn view(&self) -> PresenceView {
        self.shared.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceView> {
        self.shared.view_tx.subscribe()
    }

    /// Color sent with the current membership.
    pub fn color(&self) -> Option<String> {
        lock(&self.shared.session).color().map(str::to_string)
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shared.update(PresenceSession::leave);
    }
}

// ─── Task ─────────────────────────────────────────────────────────

struct TrackerTask {
    shared: Arc<Shared>,
    connection: watch::Receiver<bool>,
    activity: watch::Receiver<bool>,
    events: broadcast::Receiver<WireFrame>,
    heartbeat_every: Duration,
    cancel: CancellationToken,
}

/// Heartbeat timer plus the membership it belongs to, so a rejoin restarts it.
type Heartbeat = (Option<String>, Option<String>, Interval);

async fn tick(heartbeat: &mut Option<Heartbeat>) {
    match heartbeat {
        Some((_, _, interval)) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl TrackerTask {
    async fn run(mut self) {
        let mut heartbeat: Option<Heartbeat> = None;
        let mut connection_open = true;
        let mut activity_open = true;
        let mut events_open = true;

        loop {
            self.arm(&mut heartbeat);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.shared.wake.notified() => {}
                changed = self.connection.changed(), if connection_open => match changed {
                    Ok(()) => {
                        let connected = *self.connection.borrow_and_update();
                        info!(connected, "presence: connection changed");
                        self.shared.update(|s| s.set_connected(connected));
                    }
                    Err(_) => connection_open = false,
                },
                changed = self.activity.changed(), if activity_open => match changed {
                    Ok(()) => {
                        let active = *self.activity.borrow_and_update();
                        self.shared.update(|s| s.set_active(active, clock::now_ms()));
                    }
                    Err(_) => activity_open = false,
                },
                frame = self.events.recv(), if events_open => match frame {
                    Ok(frame) => match ServerEvent::from_wire(&frame) {
                        Ok(event) => self.shared.update(|s| s.on_server_event(event)),
                        Err(e) => debug!(event = %frame.event, error = %e, "presence: ignoring frame"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence: event receiver lagged");
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                () = tick(&mut heartbeat) => {
                    self.shared.update(PresenceSession::heartbeat_due);
                }
            }
        }

        // Session teardown through the cancel token also leaves the room.
        self.shared.update(PresenceSession::leave);
    }

    fn arm(&self, heartbeat: &mut Option<Heartbeat>) {
        let (armed, key) = {
            let session = lock(&self.shared.session);
            let key = (
                session.joined_resource().map(str::to_string),
                session.color().map(str::to_string),
            );
            (session.heartbeat_armed(), key)
        };
        if !armed {
            *heartbeat = None;
            return;
        }
        if heartbeat
            .as_ref()
            .is_some_and(|(room, color, _)| (room, color) == (&key.0, &key.1))
        {
            return;
        }
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.heartbeat_every,
            self.heartbeat_every,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        *heartbeat = Some((key.0, key.1, interval));
    }
}
