//! Presence session state machine for one tab and one room kind.
//!
//! Inputs (resource, user, connectivity, activity, heartbeat timer, sync
//! events) go in; [`PresenceCommand`]s come out. The caller emits the
//! events on its realtime channel and arms or disarms its heartbeat timer.
//!
//! State is derived from the inputs after each call:
//!
//! | resource + user | connected | active | state                |
//! |-----------------|-----------|--------|----------------------|
//! | missing         | any       | any    | `Idle`               |
//! | present         | no        | any    | `AwaitingConnection` |
//! | present         | yes       | yes    | `Joined`             |
//! | present         | yes       | no     | `Suspended`          |
//!
//! Switching rooms always leaves the old room before joining the new one.
//! A tab hidden long enough for the server to have expired its entry
//! re-joins on resume instead of sending a heartbeat.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::{ClientEvent, ServerEvent};
use crate::roster::{PresenceView, Roster};
use crate::types::{ColorSource, ResourceKind, UserIdentity};

// ─── Types ────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Idle,
    AwaitingConnection,
    Joined,
    Suspended,
}

/// Side effects the driver must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceCommand {
    Emit(ClientEvent),
    StartHeartbeat,
    StopHeartbeat,
    /// The roster changed (sync received, or cleared on leave).
    RosterChanged,
}

// ─── PresenceSession ──────────────────────────────────────────────

pub struct PresenceSession {
    kind: ResourceKind,
    resource_id: Option<String>,
    user: Option<UserIdentity>,
    connected: bool,
    active: bool,
    /// Room this tab is currently a member of on the server.
    joined: Option<String>,
    color: Option<String>,
    roster: Roster,
    colors: Box<dyn ColorSource>,
    hidden_since_ms: Option<u64>,
    /// Hidden at least this long means the server entry may be gone.
    rejoin_after_ms: Option<u64>,
}

impl fmt::Debug for PresenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSession")
            .field("kind", &self.kind)
            .field("resource_id", &self.resource_id)
            .field("joined", &self.joined)
            .field("connected", &self.connected)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl PresenceSession {
    pub fn new(kind: ResourceKind, colors: Box<dyn ColorSource>) -> Self {
        Self {
            kind,
            resource_id: None,
            user: None,
            connected: false,
            active: true,
            joined: None,
            color: None,
            roster: Roster::default(),
            colors,
            hidden_since_ms: None,
            rejoin_after_ms: None,
        }
    }

    /// Re-join instead of heartbeating when resuming after `ms` or more
    /// hidden. Without it a resume always sends a heartbeat.
    pub fn with_rejoin_after(mut self, ms: u64) -> Self {
        self.rejoin_after_ms = Some(ms);
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn state(&self) -> PresenceState {
        if self.desired_room().is_none() {
            PresenceState::Idle
        } else if self.joined.is_none() {
            PresenceState::AwaitingConnection
        } else if self.active {
            PresenceState::Joined
        } else {
            PresenceState::Suspended
        }
    }

    pub fn joined_resource(&self) -> Option<&str> {
        self.joined.as_deref()
    }

    /// Color sent with the current membership, if joined.
    pub fn color(&self) -> Option<&str> {
        self.color.as_deref()
    }

    /// Whether the driver's heartbeat timer should be running.
    pub fn heartbeat_armed(&self) -> bool {
        self.joined.is_some() && self.active
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn view(&self) -> PresenceView {
        PresenceView {
            resource_id: self.joined.clone(),
            self_user_id: self.user.as_ref().map(|u| u.id.clone()),
            roster: self.roster.clone(),
        }
    }

    // ── Inputs ───────────────────────────────────────────────────

    /// `None` (or an empty id) disables tracking.
    pub fn set_resource(&mut self, resource_id: Option<String>) -> Vec<PresenceCommand> {
        self.resource_id = resource_id.filter(|id| !id.is_empty());
        self.reconcile()
    }

    pub fn set_user(&mut self, user: Option<UserIdentity>) -> Vec<PresenceCommand> {
        let changed = user.as_ref().map(|u| &u.id) != self.user.as_ref().map(|u| &u.id);
        self.user = user;
        if changed && self.joined.is_some() {
            // Re-announce under the new identity.
            let mut cmds = self.leave_current(true);
            cmds.extend(self.reconcile());
            return cmds;
        }
        self.reconcile()
    }

    pub fn set_connected(&mut self, connected: bool) -> Vec<PresenceCommand> {
        self.connected = connected;
        self.reconcile()
    }

    pub fn set_active(&mut self, active: bool, now_ms: u64) -> Vec<PresenceCommand> {
        let was_active = self.active;
        self.active = active;
        let hidden_for = match (was_active, active) {
            (true, false) => {
                self.hidden_since_ms = Some(now_ms);
                None
            }
            (false, true) => self
                .hidden_since_ms
                .take()
                .map(|since| now_ms.saturating_sub(since)),
            _ => None,
        };
        let Some(room) = self.joined.clone() else {
            return Vec::new();
        };
        match (was_active, active) {
            (true, false) => vec![PresenceCommand::StopHeartbeat],
            (false, true) => {
                let lapsed = match (hidden_for, self.rejoin_after_ms) {
                    (Some(hidden), Some(limit)) => hidden >= limit,
                    _ => false,
                };
                let event = match self.user.clone() {
                    Some(user) if lapsed => {
                        let color = self.colors.next_color();
                        self.color = Some(color.clone());
                        ClientEvent::Join {
                            kind: self.kind,
                            resource_id: room,
                            user,
                            color,
                        }
                    }
                    _ => ClientEvent::Heartbeat {
                        kind: self.kind,
                        resource_id: room,
                    },
                };
                vec![
                    PresenceCommand::Emit(event),
                    PresenceCommand::StartHeartbeat,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// The heartbeat timer fired.
    pub fn heartbeat_due(&mut self) -> Vec<PresenceCommand> {
        match &self.joined {
            Some(room) if self.active && self.connected => {
                vec![PresenceCommand::Emit(ClientEvent::Heartbeat {
                    kind: self.kind,
                    resource_id: room.clone(),
                })]
            }
            _ => Vec::new(),
        }
    }

    /// Apply a server push. Syncs for other rooms are ignored.
    pub fn on_server_event(&mut self, event: ServerEvent) -> Vec<PresenceCommand> {
        match event {
            ServerEvent::Sync {
                kind,
                resource_id,
                roster,
            } => {
                if kind != self.kind || self.joined.as_deref() != Some(resource_id.as_str()) {
                    return Vec::new();
                }
                self.roster.replace(roster);
                vec![PresenceCommand::RosterChanged]
            }
        }
    }

    /// Teardown: leave the room (if any) and forget the resource.
    pub fn leave(&mut self) -> Vec<PresenceCommand> {
        self.resource_id = None;
        self.reconcile()
    }

    // ── Internals ────────────────────────────────────────────────

    fn desired_room(&self) -> Option<&str> {
        self.user.as_ref()?;
        self.resource_id.as_deref()
    }

    fn leave_current(&mut self, emit: bool) -> Vec<PresenceCommand> {
        let Some(room) = self.joined.take() else {
            return Vec::new();
        };
        self.color = None;
        let mut cmds = Vec::with_capacity(3);
        if emit {
            cmds.push(PresenceCommand::Emit(ClientEvent::Leave {
                kind: self.kind,
                resource_id: room,
            }));
        }
        cmds.push(PresenceCommand::StopHeartbeat);
        if !self.roster.is_empty() {
            self.roster.clear();
            cmds.push(PresenceCommand::RosterChanged);
        }
        cmds
    }

    fn reconcile(&mut self) -> Vec<PresenceCommand> {
        let mut cmds = Vec::new();
        let desired = self.desired_room().map(str::to_string);

        if let Some(joined) = self.joined.clone() {
            if !self.connected {
                // The server already dropped us with the socket; nothing to
                // emit. The roster is kept until the rejoin sync replaces it.
                self.joined = None;
                self.color = None;
                cmds.push(PresenceCommand::StopHeartbeat);
            } else if desired.as_deref() != Some(joined.as_str()) {
                cmds.extend(self.leave_current(true));
            }
        }

        if self.joined.is_none()
            && self.connected
            && let (Some(room), Some(user)) = (desired, self.user.clone())
        {
            let color = self.colors.next_color();
            cmds.push(PresenceCommand::Emit(ClientEvent::Join {
                kind: self.kind,
                resource_id: room.clone(),
                user,
                color: color.clone(),
            }));
            self.joined = Some(room);
            self.color = Some(color);
            if self.active {
                cmds.push(PresenceCommand::StartHeartbeat);
            }
        }

        cmds
    }
}

// ─── Tests ────────────────────────────────────────────────────────
