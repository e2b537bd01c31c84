//! Shared vocabulary: channel keys, room kinds with their wire event
//! names, user identity and the presence entry the server reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

// ─── Channel keys ─────────────────────────────────────────────────

/// Leader-election key for a polling channel.
pub fn polling_leader_key(channel_name: &str) -> String {
    format!("polling-{channel_name}")
}

/// Bus channel carrying fetched payloads for a polling channel.
pub fn polling_data_channel(channel_name: &str) -> String {
    format!("data-{channel_name}")
}

// ─── Resource kind ────────────────────────────────────────────────

/// The two kinds of room a tab can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Document,
    Conversation,
}

impl ResourceKind {
    pub const ALL: [Self; 2] = [Self::Document, Self::Conversation];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Conversation => "conversation",
        }
    }

    pub fn join_event(self) -> &'static str {
        match self {
            Self::Document => "join:document",
            Self::Conversation => "join:conversation",
        }
    }

    pub fn leave_event(self) -> &'static str {
        match self {
            Self::Document => "leave:document",
            Self::Conversation => "leave:conversation",
        }
    }

    /// Both room kinds share one heartbeat event; the payload key tells them apart.
    pub fn heartbeat_event(self) -> &'static str {
        "presence:heartbeat"
    }

    pub fn sync_event(self) -> &'static str {
        match self {
            Self::Document => "presence:sync",
            Self::Conversation => "viewers:sync",
        }
    }

    /// Payload key carrying the resource id (`documentId` / `conversationId`).
    pub fn id_key(self) -> &'static str {
        match self {
            Self::Document => "documentId",
            Self::Conversation => "conversationId",
        }
    }

    /// Payload key carrying the roster in a sync event.
    pub fn roster_key(self) -> &'static str {
        match self {
            Self::Document => "users",
            Self::Conversation => "viewers",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" => Ok(Self::Document),
            "conversation" => Ok(Self::Conversation),
            _ => Err(SyncError::UnknownEvent(format!("unknown resource kind: {s}"))),
        }
    }
}

// ─── Identity ─────────────────────────────────────────────────────

/// Authenticated user as supplied by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    #[must_use]
    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// Source of per-join display colors.
pub trait ColorSource: Send {
    fn next_color(&mut self) -> String;
}

impl<F: FnMut() -> String + Send> ColorSource for F {
    fn next_color(&mut self) -> String {
        self()
    }
}

// ─── Presence ─────────────────────────────────────────────────────

/// One connection's occupancy of a room, as delivered by a sync event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub color: String,
    pub connected_at: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn from_identity(user: &UserIdentity, color: String, connected_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            color,
            connected_at,
        }
    }
}
