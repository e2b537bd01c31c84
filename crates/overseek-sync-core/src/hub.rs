//! Loopback presence hub: the server side of the presence wire contract.
//!
//! Keeps one entry per connection per room, refreshes entries on heartbeat
//! and expires them after `ttl_ms` of silence. Every membership change
//! produces a [`RoomUpdate`] carrying the full roster and the connections
//! that must receive it.
//!
//! Used by the runtime's in-process realtime server for simulation and
//! tests. Real deployments talk to the backend instead.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::envelope::{ClientEvent, ServerEvent};
use crate::types::{PresenceEntry, ResourceKind};

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    entry: PresenceEntry,
    last_heartbeat_ms: u64,
}

/// Roster push for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomUpdate {
    pub recipients: Vec<ConnectionId>,
    pub event: ServerEvent,
}

type RoomKey = (ResourceKind, String);

#[derive(Debug, Clone)]
pub struct PresenceHub {
    ttl_ms: u64,
    rooms: HashMap<RoomKey, BTreeMap<ConnectionId, Member>>,
}

impl PresenceHub {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            rooms: HashMap::new(),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Apply one client event from `conn`.
    pub fn apply(
        &mut self,
        conn: ConnectionId,
        event: ClientEvent,
        now_ms: u64,
        connected_at: DateTime<Utc>,
    ) -> Option<RoomUpdate> {
        match event {
            ClientEvent::Join {
                kind,
                resource_id,
                user,
                color,
            } => {
                let key = (kind, resource_id);
                let room = self.rooms.entry(key.clone()).or_default();
                room.insert(
                    conn,
                    Member {
                        entry: PresenceEntry::from_identity(&user, color, connected_at),
                        last_heartbeat_ms: now_ms,
                    },
                );
                self.update_for(&key)
            }
            ClientEvent::Leave { kind, resource_id } => {
                let key = (kind, resource_id);
                let removed = self
                    .rooms
                    .get_mut(&key)
                    .and_then(|room| room.remove(&conn))
                    .is_some();
                if !removed {
                    return None;
                }
                self.update_for(&key)
            }
            ClientEvent::Heartbeat { kind, resource_id } => {
                if let Some(member) = self
                    .rooms
                    .get_mut(&(kind, resource_id))
                    .and_then(|room| room.get_mut(&conn))
                {
                    member.last_heartbeat_ms = now_ms;
                }
                None
            }
        }
    }

    /// Drop every membership held by `conn` (socket closed).
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<RoomUpdate> {
        let keys: Vec<RoomKey> = self
            .rooms
            .iter_mut()
            .filter_map(|(key, room)| room.remove(&conn).map(|_| key.clone()))
            .collect();
        self.updates_for(keys)
    }

    /// Remove entries whose last heartbeat is older than the TTL.
    pub fn expire(&mut self, now_ms: u64) -> Vec<RoomUpdate> {
        let ttl = self.ttl_ms;
        let mut keys = Vec::new();
        for (key, room) in &mut self.rooms {
            let before = room.len();
            room.retain(|_, m| now_ms.saturating_sub(m.last_heartbeat_ms) <= ttl);
            if room.len() != before {
                keys.push(key.clone());
            }
        }
        self.updates_for(keys)
    }

    pub fn roster(&self, kind: ResourceKind, resource_id: &str) -> Vec<PresenceEntry> {
        self.rooms
            .get(&(kind, resource_id.to_string()))
            .map(|room| room.values().map(|m| m.entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.values().filter(|r| !r.is_empty()).count()
    }

    fn updates_for(&mut self, mut keys: Vec<RoomKey>) -> Vec<RoomUpdate> {
        keys.sort();
        keys.into_iter().filter_map(|k| self.update_for(&k)).collect()
    }

    fn update_for(&mut self, key: &RoomKey) -> Option<RoomUpdate> {
        let room = self.rooms.get(key)?;
        if room.is_empty() {
            self.rooms.remove(key);
            return None;
        }
        Some(RoomUpdate {
            recipients: room.keys().copied().collect(),
            event: ServerEvent::Sync {
                kind: key.0,
                resource_id: key.1.clone(),
                roster: room.values().map(|m| m.entry.clone()).collect(),
            },
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PRESENCE_TTL_MS;
    use crate::types::UserIdentity;

    fn join(doc: &str, user: &str) -> ClientEvent {
        ClientEvent::Join {
            kind: ResourceKind::Document,
            resource_id: doc.into(),
            user: UserIdentity::new(user, user.to_uppercase()),
            color: format!("color-{user}"),
        }
    }

    fn leave(doc: &str) -> ClientEvent {
        ClientEvent::Leave {
            kind: ResourceKind::Document,
            resource_id: doc.into(),
        }
    }

    fn heartbeat(doc: &str) -> ClientEvent {
        ClientEvent::Heartbeat {
            kind: ResourceKind::Document,
            resource_id: doc.into(),
        }
    }

    fn roster_ids(update: &RoomUpdate) -> Vec<String> {
        let ServerEvent::Sync { roster, .. } = &update.event;
        roster.iter().map(|e| e.user_id.clone()).collect()
    }

    #[test]
    fn join_syncs_everyone_in_room() {
        let mut hub = PresenceHub::new(DEFAULT_PRESENCE_TTL_MS);
        let now = Utc::now();
        let first = hub.apply(1, join("doc", "a"), 0, now).expect("update");
        assert_eq!(first.recipients, vec![1]);

        let second = hub.apply(2, join("doc", "b"), 10, now).expect("update");
        assert_eq!(second.recipients, vec![1, 2]);
        assert_eq!(roster_ids(&second), vec!["a", "b"]);
    }

    #[test]
    fn leave_syncs_remaining_members() {
        let mut hub = PresenceHub::new(DEFAULT_PRESENCE_TTL_MS);
        let now = Utc::now();
        hub.apply(1, join("doc", "a"), 0, now);
        hub.apply(2, join("doc", "b"), 0, now);

        let update = hub.apply(1, leave("doc"), 5, now).expect("update");
        assert_eq!(update.recipients, vec![2]);
        assert_eq!(roster_ids(&update), vec!["b"]);

        assert!(hub.apply(1, leave("doc"), 6, now).is_none(), "not a member");
        assert!(hub.apply(2, leave("doc"), 7, now).is_none(), "room now empty");
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn same_user_two_connections_are_two_entries() {
        let mut hub = PresenceHub::new(DEFAULT_PRESENCE_TTL_MS);
        let now = Utc::now();
        hub.apply(1, join("doc", "a"), 0, now);
        let update = hub.apply(2, join("doc", "a"), 0, now).expect("update");
        assert_eq!(roster_ids(&update), vec!["a", "a"]);
    }

    #[test]
    fn heartbeat_keeps_entry_alive() {
        let mut hub = PresenceHub::new(1_000);
        let now = Utc::now();
        hub.apply(1, join("doc", "a"), 0, now);
        hub.apply(2, join("doc", "b"), 0, now);
        assert!(hub.apply(1, heartbeat("doc"), 900, now).is_none());

        let updates = hub.expire(1_500);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].recipients, vec![1]);
        assert_eq!(roster_ids(&updates[0]), vec!["a"]);
    }

    #[test]
    fn expiry_boundary_is_inclusive_of_ttl() {
        let mut hub = PresenceHub::new(1_000);
        hub.apply(1, join("doc", "a"), 0, Utc::now());
        assert!(hub.expire(1_000).is_empty());
        assert!(hub.expire(1_001).is_empty(), "room emptied, nobody to tell");
        assert!(hub.roster(ResourceKind::Document, "doc").is_empty());
    }

    #[test]
    fn disconnect_removes_from_all_rooms() {
        let mut hub = PresenceHub::new(DEFAULT_PRESENCE_TTL_MS);
        let now = Utc::now();
        hub.apply(1, join("doc-1", "a"), 0, now);
        hub.apply(1, join("doc-2", "a"), 0, now);
        hub.apply(2, join("doc-2", "b"), 0, now);

        let updates = hub.disconnect(1);
        assert_eq!(updates.len(), 1, "doc-1 is now empty");
        assert_eq!(updates[0].recipients, vec![2]);
        assert_eq!(hub.room_count(), 1);
    }

    #[test]
    fn rooms_are_scoped_by_kind() {
        let mut hub = PresenceHub::new(DEFAULT_PRESENCE_TTL_MS);
        let now = Utc::now();
        hub.apply(1, join("x", "a"), 0, now);
        let conv = ClientEvent::Join {
            kind: ResourceKind::Conversation,
            resource_id: "x".into(),
            user: UserIdentity::new("b", "B"),
            color: "c".into(),
        };
        let update = hub.apply(2, conv, 0, now).expect("update");
        assert_eq!(update.recipients, vec![2]);
        assert_eq!(hub.roster(ResourceKind::Document, "x").len(), 1);
        assert_eq!(hub.roster(ResourceKind::Conversation, "x").len(), 1);
    }
}
