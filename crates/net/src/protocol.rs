//! Network protocol message types
//!
//! All events are JSON-serialized and length-prefixed on the wire. Event
//! names and payload keys are camelCase, carried in a `type` tag:
//! `{"type":"joinRoom","username":"alice","room":"general"}`.
//!
//! Outbound events are defined in `quorum-core` ([`ServerEvent`]) because
//! the engine constructs them; this module owns the inbound vocabulary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use quorum_core::ServerEvent;

/// Events received from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Request the list of current room names
    GetRooms,

    /// Join (or create) a room
    JoinRoom { username: String, room: String },

    /// Send a chat message to the sender's remembered room
    ChatMessage { text: String },

    /// Mark a message as read
    MessageRead {
        room: String,
        message_id: String,
        user_id: Uuid,
    },

    /// Delete a message (author or admin)
    DeleteMessage { room: String, message_id: String },

    /// Edit a message (author only, within the edit window)
    EditMessage {
        room: String,
        message_id: String,
        new_text: String,
    },

    PinMessage { room: String, message_id: String },
    UnpinMessage { room: String },

    /// Update the room's theme/background (admin only)
    UpdateRoomAppearance {
        room: String,
        theme: Option<String>,
        background_color: Option<String>,
    },

    /// Typing indicators, relayed to the rest of the room
    Typing { room: String, username: String },
    StopTyping { room: String, username: String },

    /// Remove a member from the room (admin only)
    KickUser { room: String, target_user_id: Uuid },

    /// Start a poll (admin only)
    StartPoll {
        room: String,
        question: String,
        options: Vec<String>,
        #[serde(default)]
        multiple: bool,
        #[serde(default)]
        duration_sec: Option<f64>,
    },

    /// Vote on the active poll
    VotePoll {
        room: String,
        option_indexes: Vec<i64>,
    },

    /// End the active poll early (admin only)
    EndPoll { room: String },

    /// Search the room's message log; answered directly to the requester
    SearchMessages { room: String, query: String },
}
