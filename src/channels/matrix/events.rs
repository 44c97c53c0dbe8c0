//! Typed events the remote session pushes to the adapter.
//!
//! Only the fields admission and normalization need are carried; the
//! session is responsible for extracting them from protocol JSON.

use serde_json::Value;

/// Protocol-native mention payload (`m.mentions`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    /// User ids explicitly mentioned.
    pub user_ids: Vec<String>,
    /// Whether the whole room was mentioned (`@room`).
    pub room: bool,
}

impl Mentions {
    /// Extract `m.mentions` from a message event's `content` object.
    ///
    /// Returns `None` when the field is absent or not an object. Entries of
    /// the wrong type are skipped rather than rejected.
    pub fn from_content(content: &Value) -> Option<Self> {
        let raw = content.get("m.mentions")?.as_object()?;
        let user_ids = raw
            .get("user_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let room = raw.get("room").and_then(Value::as_bool).unwrap_or(false);
        Some(Self { user_ids, room })
    }

    /// Whether `user_id` is listed explicitly.
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.user_ids.iter().any(|id| id == user_id)
    }
}

/// Room context for an inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomInfo {
    /// Room identifier, e.g. `!abc:matrix.org`.
    pub room_id: String,
    /// Human-readable room name, if known.
    pub display_name: Option<String>,
    /// Joined member count, if the server reported it.
    pub member_count: Option<u64>,
}

impl RoomInfo {
    /// Build room info with only an id.
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            display_name: None,
            member_count: None,
        }
    }

    /// Direct rooms have a known member count of two or fewer.
    pub fn is_direct(&self) -> bool {
        self.member_count.is_some_and(|n| n <= 2)
    }

    /// Display name, falling back to the room id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.room_id)
    }
}

/// A text message observed in a joined room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundEvent {
    /// Sender's user id.
    pub sender: String,
    /// Plain-text body.
    pub body: String,
    /// Native mention payload, absent if the event carried none.
    pub mentions: Option<Mentions>,
}

/// An invitation for the bot to join a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInvite {
    /// Room the bot was invited to.
    pub room_id: String,
    /// User id of the inviter.
    pub sender: String,
}

/// Events emitted by a [`RemoteSession`](super::session::RemoteSession), in
/// the order the server delivered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A text message in a joined room.
    Message {
        /// Room the message arrived in.
        room: RoomInfo,
        /// The message itself.
        event: InboundEvent,
    },
    /// The bot was invited to a room.
    Invite(RoomInvite),
}
