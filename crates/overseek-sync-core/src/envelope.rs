//! Typed envelopes for the two transports.
//!
//! - [`BusMessage`]: tab-to-tab messages on the broadcast bus (leader
//!   election and polling data fan-out). JSON with a kebab-case `type` tag.
//! - [`ClientEvent`] / [`ServerEvent`]: presence traffic on the realtime
//!   channel, carried as a [`WireFrame`] of event name plus JSON payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SyncError;
use crate::types::{PresenceEntry, ResourceKind, UserIdentity};

// ─── Bus ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BusMessage {
    /// "I am alive and this is my claim."
    LeaderAnnounce { tab_id: String, claimed_at: u64 },
    /// Sent by a tab giving up its claim (unload / unsubscribe).
    LeaderAbdicate { tab_id: String },
    /// A fetched polling payload.
    Data {
        channel_name: String,
        payload: Value,
        timestamp: u64,
    },
}

impl BusMessage {
    pub fn data<T: Serialize>(
        channel_name: &str,
        payload: &T,
        timestamp: u64,
    ) -> Result<Self, SyncError> {
        Ok(Self::Data {
            channel_name: channel_name.to_string(),
            payload: serde_json::to_value(payload)?,
            timestamp,
        })
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Decode the payload of a `data` message addressed to `channel_name`.
///
/// Returns `Ok(None)` for other message kinds or other channels.
pub fn decode_data<T: DeserializeOwned>(
    msg: &BusMessage,
    channel_name: &str,
) -> Result<Option<(T, u64)>, SyncError> {
    match msg {
        BusMessage::Data {
            channel_name: name,
            payload,
            timestamp,
        } if name == channel_name => {
            let value = T::deserialize(payload)?;
            Ok(Some((value, *timestamp)))
        }
        _ => Ok(None),
    }
}

// ─── Realtime wire ────────────────────────────────────────────────

/// One socket-level event: name plus JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    pub payload: Value,
}

impl WireFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Events a tab sends to the realtime server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Join {
        kind: ResourceKind,
        resource_id: String,
        user: UserIdentity,
        color: String,
    },
    Leave {
        kind: ResourceKind,
        resource_id: String,
    },
    Heartbeat {
        kind: ResourceKind,
        resource_id: String,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Join { kind, .. } | Self::Leave { kind, .. } | Self::Heartbeat { kind, .. } => {
                *kind
            }
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            Self::Join { resource_id, .. }
            | Self::Leave { resource_id, .. }
            | Self::Heartbeat { resource_id, .. } => resource_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { kind, .. } => kind.join_event(),
            Self::Leave { kind, .. } => kind.leave_event(),
            Self::Heartbeat { kind, .. } => kind.heartbeat_event(),
        }
    }

    pub fn to_wire(&self) -> WireFrame {
        let kind = self.kind();
        let mut payload = json!({ kind.id_key(): self.resource_id() });
        if let Self::Join { user, color, .. } = self {
            payload["user"] = json!({
                "id": user.id,
                "name": user.display_name,
                "avatarUrl": user.avatar_url,
                "color": color,
            });
        }
        WireFrame::new(self.name(), payload)
    }

    pub fn from_wire(frame: &WireFrame) -> Result<Self, SyncError> {
        let (kind, op) = match frame.event.as_str() {
            "join:document" => (ResourceKind::Document, Op::Join),
            "leave:document" => (ResourceKind::Document, Op::Leave),
            "join:conversation" => (ResourceKind::Conversation, Op::Join),
            "leave:conversation" => (ResourceKind::Conversation, Op::Leave),
            "presence:heartbeat" => {
                // The id key tells the room kinds apart.
                let kind = ResourceKind::ALL
                    .into_iter()
                    .find(|k| frame.payload.get(k.id_key()).is_some())
                    .ok_or_else(|| {
                        SyncError::UnknownEvent("presence:heartbeat without resource id".into())
                    })?;
                (kind, Op::Heartbeat)
            }
            other => return Err(SyncError::UnknownEvent(other.to_string())),
        };

        let resource_id = read_id(&frame.payload, kind)?;
        Ok(match op {
            Op::Join => {
                let user: WireUser = serde_json::from_value(
                    frame.payload.get("user").cloned().unwrap_or(Value::Null),
                )?;
                Self::Join {
                    kind,
                    resource_id,
                    color: user.color,
                    user: UserIdentity {
                        id: user.id,
                        display_name: user.name,
                        avatar_url: user.avatar_url,
                    },
                }
            }
            Op::Leave => Self::Leave { kind, resource_id },
            Op::Heartbeat => Self::Heartbeat { kind, resource_id },
        })
    }
}

enum Op {
    Join,
    Leave,
    Heartbeat,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    id: String,
    name: String,
    #[serde(default)]
    avatar_url: Option<String>,
    color: String,
}

fn read_id(payload: &Value, kind: ResourceKind) -> Result<String, SyncError> {
    payload
        .get(kind.id_key())
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SyncError::UnknownEvent(format!("missing {}", kind.id_key())))
}

/// Events the realtime server pushes to tabs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Full roster of a room; replaces whatever the tab had.
    Sync {
        kind: ResourceKind,
        resource_id: String,
        roster: Vec<PresenceEntry>,
    },
}

impl ServerEvent {
    pub fn to_wire(&self) -> WireFrame {
        match self {
            Self::Sync {
                kind,
                resource_id,
                roster,
            } => WireFrame::new(
                kind.sync_event(),
                json!({ kind.id_key(): resource_id, kind.roster_key(): roster }),
            ),
        }
    }

    pub fn from_wire(frame: &WireFrame) -> Result<Self, SyncError> {
        let kind = ResourceKind::ALL
            .into_iter()
            .find(|k| k.sync_event() == frame.event)
            .ok_or_else(|| SyncError::UnknownEvent(frame.event.clone()))?;
        let resource_id = read_id(&frame.payload, kind)?;
        let roster: Vec<PresenceEntry> = match frame.payload.get(kind.roster_key()) {
            Some(value) => Vec::<PresenceEntry>::deserialize(value)?,
            None => Vec::new(),
        };
        Ok(Self::Sync {
            kind,
            resource_id,
            roster,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(user_id: &str) -> PresenceEntry {
        PresenceEntry {
            user_id: user_id.to_string(),
            display_name: user_id.to_uppercase(),
            avatar_url: None,
            color: "hsl(10, 70%, 50%)".to_string(),
            connected_at: chrono::Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("valid date"),
        }
    }

    // ── Bus ──────────────────────────────────────────────────────

    #[test]
    fn data_envelope_shape() {
        let msg = BusMessage::data("live-analytics", &json!({"count": 5}), 1234).expect("encode");
        let value: Value = serde_json::from_str(&msg.encode().expect("encode")).expect("json");
        assert_eq!(value["type"], "data");
        assert_eq!(value["channelName"], "live-analytics");
        assert_eq!(value["payload"]["count"], 5);
        assert_eq!(value["timestamp"], 1234);
    }

    #[test]
    fn leader_messages_use_kebab_tags() {
        let announce = BusMessage::LeaderAnnounce {
            tab_id: "tab-a".into(),
            claimed_at: 7,
        };
        let text = announce.encode().expect("encode");
        assert!(text.contains(r#""type":"leader-announce""#));
        assert!(text.contains(r#""tabId":"tab-a""#));
        assert!(text.contains(r#""claimedAt":7"#));
        assert_eq!(BusMessage::decode(&text).expect("decode"), announce);

        let abdicate = BusMessage::LeaderAbdicate {
            tab_id: "tab-a".into(),
        };
        assert!(
            abdicate
                .encode()
                .expect("encode")
                .contains(r#""type":"leader-abdicate""#)
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(BusMessage::decode("{\"type\":\"nope\"}").is_err());
        assert!(BusMessage::decode("not json").is_err());
    }

    #[test]
    fn decode_data_filters_channel() {
        let msg = BusMessage::data("a", &json!({"n": 1}), 5).expect("encode");
        let hit: Option<(Value, u64)> = decode_data(&msg, "a").expect("decode");
        assert_eq!(hit, Some((json!({"n": 1}), 5)));
        let miss: Option<(Value, u64)> = decode_data(&msg, "b").expect("decode");
        assert!(miss.is_none());

        let announce = BusMessage::LeaderAnnounce {
            tab_id: "t".into(),
            claimed_at: 0,
        };
        let none: Option<(Value, u64)> = decode_data(&announce, "a").expect("decode");
        assert!(none.is_none());
    }

    #[test]
    fn decode_data_type_mismatch_is_error() {
        let msg = BusMessage::data("a", &json!("text"), 5).expect("encode");
        let res: Result<Option<(u32, u64)>, _> = decode_data(&msg, "a");
        assert!(res.is_err());
    }

    // ── Client events ────────────────────────────────────────────

    #[test]
    fn join_document_wire_shape() {
        let event = ClientEvent::Join {
            kind: ResourceKind::Document,
            resource_id: "doc-1".into(),
            user: UserIdentity::new("u1", "Ada").with_avatar("https://a/1.png"),
            color: "hsl(1, 70%, 50%)".into(),
        };
        let frame = event.to_wire();
        assert_eq!(frame.event, "join:document");
        assert_eq!(frame.payload["documentId"], "doc-1");
        assert_eq!(frame.payload["user"]["id"], "u1");
        assert_eq!(frame.payload["user"]["name"], "Ada");
        assert_eq!(frame.payload["user"]["avatarUrl"], "https://a/1.png");
        assert_eq!(ClientEvent::from_wire(&frame).expect("decode"), event);
    }

    #[test]
    fn heartbeat_kind_follows_payload_key() {
        let event = ClientEvent::Heartbeat {
            kind: ResourceKind::Conversation,
            resource_id: "conv-9".into(),
        };
        let frame = event.to_wire();
        assert_eq!(frame.event, "presence:heartbeat");
        assert_eq!(frame.payload["conversationId"], "conv-9");
        assert_eq!(ClientEvent::from_wire(&frame).expect("decode"), event);
    }

    #[test]
    fn leave_conversation_decodes() {
        let frame = WireFrame::new("leave:conversation", json!({"conversationId": "c"}));
        assert_eq!(
            ClientEvent::from_wire(&frame).expect("decode"),
            ClientEvent::Leave {
                kind: ResourceKind::Conversation,
                resource_id: "c".into()
            }
        );
    }

    #[test]
    fn unknown_client_event_rejected() {
        let frame = WireFrame::new("typing:start", json!({}));
        assert!(matches!(
            ClientEvent::from_wire(&frame),
            Err(SyncError::UnknownEvent(_))
        ));
        let frame = WireFrame::new("presence:heartbeat", json!({}));
        assert!(ClientEvent::from_wire(&frame).is_err());
    }

    // ── Server events ────────────────────────────────────────────

    #[test]
    fn presence_sync_wire_shape() {
        let event = ServerEvent::Sync {
            kind: ResourceKind::Document,
            resource_id: "doc-1".into(),
            roster: vec![entry("a"), entry("b")],
        };
        let frame = event.to_wire();
        assert_eq!(frame.event, "presence:sync");
        assert_eq!(frame.payload["users"][1]["userId"], "b");
        assert_eq!(ServerEvent::from_wire(&frame).expect("decode"), event);
    }

    #[test]
    fn viewers_sync_uses_viewers_key() {
        let event = ServerEvent::Sync {
            kind: ResourceKind::Conversation,
            resource_id: "conv-1".into(),
            roster: vec![entry("a")],
        };
        let frame = event.to_wire();
        assert_eq!(frame.event, "viewers:sync");
        assert_eq!(frame.payload["viewers"][0]["userId"], "a");
        assert_eq!(ServerEvent::from_wire(&frame).expect("decode"), event);
    }

    #[test]
    fn sync_without_roster_is_empty() {
        let frame = WireFrame::new("presence:sync", json!({"documentId": "d"}));
        let ServerEvent::Sync { roster, .. } = ServerEvent::from_wire(&frame).expect("decode");
        assert!(roster.is_empty());
    }
}
