//! Realtime channel abstraction and the in-process loopback server.
//!
//! A [`RealtimeChannel`] is one tab's socket: named events out, named
//! events in, and a connection flag. [`LoopbackServer`] plays the backend
//! for simulations and tests by running a [`PresenceHub`] behind in-memory
//! connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use overseek_sync_core::SyncError;
use overseek_sync_core::envelope::{ClientEvent, WireFrame};
use overseek_sync_core::hub::{ConnectionId, PresenceHub, RoomUpdate};
use overseek_sync_core::types::{PresenceEntry, ResourceKind};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock;
use crate::lock;

const EVENT_CAPACITY: usize = 64;

pub trait RealtimeChannel: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Connection flag; changes on connect and disconnect.
    fn connection(&self) -> watch::Receiver<bool>;
    /// Send one event. Fails with [`SyncError::Disconnected`] while offline.
    fn emit(&self, frame: WireFrame) -> Result<(), SyncError>;
    /// Inbound events from now on.
    fn subscribe(&self) -> broadcast::Receiver<WireFrame>;
}

// ─── Server ───────────────────────────────────────────────────────

#[derive(Debug)]
struct ServerInner {
    hub: Mutex<PresenceHub>,
    outboxes: Mutex<HashMap<ConnectionId, broadcast::Sender<WireFrame>>>,
    next_conn: AtomicU64,
}

impl ServerInner {
    fn handle(&self, conn: ConnectionId, frame: &WireFrame) -> Result<(), SyncError> {
        let event = ClientEvent::from_wire(frame)?;
        debug!(conn, event = %frame.event, resource = %event.resource_id(), "loopback: client event");
        let update = lock(&self.hub).apply(conn, event, clock::now_ms(), Utc::now());
        self.push(update.into_iter());
        Ok(())
    }

    fn disconnect(&self, conn: ConnectionId) {
        let updates = lock(&self.hub).disconnect(conn);
        self.push(updates.into_iter());
    }

    fn push(&self, updates: impl Iterator<Item = RoomUpdate>) {
        let outboxes = lock(&self.outboxes);
        for update in updates {
            let frame = update.event.to_wire();
            for conn in &update.recipients {
                if let Some(tx) = outboxes.get(conn) {
                    let _ = tx.send(frame.clone());
                }
            }
        }
    }
}

/// In-process presence backend. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LoopbackServer {
    inner: Arc<ServerInner>,
}

impl LoopbackServer {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                hub: Mutex::new(PresenceHub::new(ttl_ms)),
                outboxes: Mutex::new(HashMap::new()),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new, already connected, connection.
    pub fn connect(&self) -> LoopbackConnection {
        let id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        lock(&self.inner.outboxes).insert(id, events.clone());
        debug!(conn = id, "loopback: connection opened");
        LoopbackConnection {
            id,
            server: Arc::clone(&self.inner),
            connected: watch::Sender::new(true),
            events,
        }
    }

    pub fn roster(&self, kind: ResourceKind, resource_id: &str) -> Vec<PresenceEntry> {
        lock(&self.inner.hub).roster(kind, resource_id)
    }

    /// Expire silent entries now and push the resulting syncs.
    pub fn sweep(&self) -> usize {
        let updates = lock(&self.inner.hub).expire(clock::now_ms());
        let count = updates.len();
        if count > 0 {
            info!(rooms = count, "loopback: expired silent presence entries");
        }
        self.inner.push(updates.into_iter());
        count
    }

    /// Run [`sweep`](Self::sweep) every `every` until `cancel` fires.
    pub fn spawn_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        server.sweep();
                    }
                }
            }
        })
    }
}

// ─── Connection ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct LoopbackConnection {
    id: ConnectionId,
    server: Arc<ServerInner>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<WireFrame>,
}

impl LoopbackConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Simulate the socket dropping or coming back. Dropping removes every
    /// membership this connection held on the server.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
        if !changed {
            return;
        }
        if connected {
            lock(&self.server.outboxes).insert(self.id, self.events.clone());
        } else {
            lock(&self.server.outboxes).remove(&self.id);
            self.server.disconnect(self.id);
        }
        info!(conn = self.id, connected, "loopback: connection state changed");
    }
}

impl RealtimeChannel for LoopbackConnection {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn emit(&self, frame: WireFrame) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }
        self.server.handle(self.id, &frame).inspect_err(|e| {
            warn!(conn = self.id, event = %frame.event, error = %e, "loopback: rejected client event");
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<WireFrame> {
        self.events.subscribe()
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        lock(&self.server.outboxes).remove(&self.id);
        self.server.disconnect(self.id);
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use overseek_sync_core::envelope::ServerEvent;
    use overseek_sync_core::types::UserIdentity;

    fn join(doc: &str, user: &str) -> WireFrame {
        ClientEvent::Join {
            kind: ResourceKind::Document,
            resource_id: doc.into(),
            user: UserIdentity::new(user, user),
            color: "c".into(),
        }
        .to_wire()
    }

    fn roster_of(frame: &WireFrame) -> Vec<String> {
        let ServerEvent::Sync { roster, .. } = ServerEvent::from_wire(frame).expect("sync");
        roster.into_iter().map(|e| e.user_id).collect()
    }

    #[tokio::test]
    async fn join_is_pushed_to_room_members() {
        let server = LoopbackServer::new(120_000);
        let a = server.connect();
        let b = server.connect();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.emit(join("doc", "ua")).expect("emit");
        assert_eq!(roster_of(&a_rx.recv().await.expect("frame")), vec!["ua"]);

        b.emit(join("doc", "ub")).expect("emit");
        assert_eq!(roster_of(&a_rx.recv().await.expect("frame")), vec!["ua", "ub"]);
        assert_eq!(roster_of(&b_rx.recv().await.expect("frame")), vec!["ua", "ub"]);
    }

    #[tokio::test]
    async fn disconnect_removes_membership() {
        let server = LoopbackServer::new(120_000);
        let a = server.connect();
        let b = server.connect();
        a.emit(join("doc", "ua")).expect("emit");
        b.emit(join("doc", "ub")).expect("emit");
        let mut b_rx = b.subscribe();

        a.set_connected(false);
        assert!(matches!(a.emit(join("doc", "ua")), Err(SyncError::Disconnected)));
        assert_eq!(roster_of(&b_rx.recv().await.expect("frame")), vec!["ub"]);
        assert_eq!(server.roster(ResourceKind::Document, "doc").len(), 1);
    }

    #[tokio::test]
    async fn dropping_connection_leaves_rooms() {
        let server = LoopbackServer::new(120_000);
        let a = server.connect();
        a.emit(join("doc", "ua")).expect("emit");
        drop(a);
        assert!(server.roster(ResourceKind::Document, "doc").is_empty());
    }

    #[tokio::test]
    async fn unknown_event_is_rejected() {
        let server = LoopbackServer::new(120_000);
        let a = server.connect();
        let frame = WireFrame::new("cursor:move", serde_json::json!({}));
        assert!(a.emit(frame).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_silent_entries() {
        let server = LoopbackServer::new(1_000);
        let a = server.connect();
        let b = server.connect();
        a.emit(join("doc", "ua")).expect("emit");
        b.emit(join("doc", "ub")).expect("emit");

        let cancel = CancellationToken::new();
        let sweeper = server.spawn_sweeper(Duration::from_millis(100), cancel.clone());
        tokio::time::advance(Duration::from_millis(600)).await;
        b.emit(
            ClientEvent::Heartbeat {
                kind: ResourceKind::Document,
                resource_id: "doc".into(),
            }
            .to_wire(),
        )
        .expect("heartbeat");
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        let ids: Vec<String> = server
            .roster(ResourceKind::Document, "doc")
            .into_iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(ids, vec!["ub"]);

        cancel.cancel();
        sweeper.await.expect("sweeper");
    }
}
