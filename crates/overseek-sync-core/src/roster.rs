//! Roster view over the raw presence snapshot.
//!
//! The server sends one entry per connection, so a user with two tabs shows
//! up twice. Display helpers collapse entries by `user_id` (keeping the
//! earliest connection); [`Roster::connection_count`] still counts all of
//! them.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::PresenceEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Roster {
    entries: Vec<PresenceEntry>,
}

impl Roster {
    pub fn new(entries: Vec<PresenceEntry>) -> Self {
        Self { entries }
    }

    /// Replace the whole roster. Snapshots are never merged.
    pub fn replace(&mut self, snapshot: Vec<PresenceEntry>) {
        self.entries = snapshot;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PresenceEntry] {
        &self.entries
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    /// One entry per user, in order of first appearance.
    pub fn unique_users(&self) -> Vec<&PresenceEntry> {
        let mut slot: HashMap<&str, usize> = HashMap::new();
        let mut unique: Vec<&PresenceEntry> = Vec::new();
        for entry in &self.entries {
            match slot.get(entry.user_id.as_str()) {
                Some(&i) => {
                    if entry.connected_at < unique[i].connected_at {
                        unique[i] = entry;
                    }
                }
                None => {
                    slot.insert(entry.user_id.as_str(), unique.len());
                    unique.push(entry);
                }
            }
        }
        unique
    }

    /// Unique users other than `self_user_id`.
    pub fn other_viewers(&self, self_user_id: &str) -> Vec<&PresenceEntry> {
        self.unique_users()
            .into_iter()
            .filter(|e| e.user_id != self_user_id)
            .collect()
    }

    pub fn has_other_viewers(&self, self_user_id: &str) -> bool {
        self.entries.iter().any(|e| e.user_id != self_user_id)
    }
}

/// What a presence consumer renders: the room, the roster and who "self" is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub resource_id: Option<String>,
    pub self_user_id: Option<String>,
    pub roster: Roster,
}

impl PresenceView {
    pub fn other_viewers(&self) -> Vec<&PresenceEntry> {
        match &self.self_user_id {
            Some(id) => self.roster.other_viewers(id),
            None => self.roster.unique_users(),
        }
    }

    pub fn has_other_viewers(&self) -> bool {
        !self.other_viewers().is_empty()
    }
}
