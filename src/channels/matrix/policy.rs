//! Inbound admission policy.
//!
//! Pure and deterministic: the decision depends only on configuration and
//! the event. Order of checks:
//!
//! 1. Sender allowlist (applies everywhere, direct rooms included).
//! 2. Direct rooms (known member count <= 2) are always admitted.
//! 3. Group rooms follow [`GroupPolicy`].
//!
//! Mentions are read only from the structured `m.mentions` payload; display
//! names in the body are never matched.

use crate::channels::is_sender_allowed;
use crate::config::{GroupPolicy, MatrixConfig};

use super::events::{InboundEvent, RoomInfo};

/// Signature of an admission check, so adapters can be built with a
/// substitute policy.
pub type AdmissionCheck = fn(&MatrixConfig, &RoomInfo, &InboundEvent) -> bool;

/// Decide whether an inbound message should be processed.
pub fn should_process(config: &MatrixConfig, room: &RoomInfo, event: &InboundEvent) -> bool {
    if !is_sender_allowed(&config.allow_from, &event.sender) {
        return false;
    }

    if room.is_direct() {
        return true;
    }

    match config.group_policy {
        GroupPolicy::Open => true,
        GroupPolicy::Allowlist => config
            .group_allow_from
            .iter()
            .any(|allowed| *allowed == room.room_id),
        GroupPolicy::Mention => is_bot_mentioned(config, event),
        GroupPolicy::Unknown => false,
    }
}

/// Whether the event's native mentions address the bot.
fn is_bot_mentioned(config: &MatrixConfig, event: &InboundEvent) -> bool {
    let Some(mentions) = &event.mentions else {
        return false;
    };
    mentions.mentions_user(&config.user_id) || (config.allow_room_mentions && mentions.room)
}
