//! Outbound events and delivery effects
//!
//! The engine never touches a socket. Every operation returns a list of
//! [`Effect`]s describing what the transport should deliver, schedule, or
//! cancel; the transport executes them in order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ActionKind;
use crate::models::{Appearance, Member, Message, PollView};

/// Events delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Names of all current rooms
    RoomsList { rooms: Vec<String> },

    /// The requester's own connection identity (sent on join)
    UserId { id: Uuid },

    /// Usernames currently in the room
    OnlineUsers { usernames: Vec<String> },

    /// Full member records currently in the room
    OnlineUsersWithIds { members: Vec<Member> },

    /// A chat message
    Chat { message: Message },

    /// A system notice
    System { text: String },

    /// The room's full message log (sent on join and after edit/delete)
    AllMessages { messages: Vec<Message> },

    /// The room's pinned message, or none
    PinnedMessage { message: Option<Message> },

    /// The room's display configuration
    RoomAppearance { appearance: Appearance },

    /// The room's active poll, or none (sent on join)
    ActivePoll { poll: Option<PollView> },

    /// Private notification to a mentioned member
    MentionNotify { text: String },

    /// A member was added to a message's read set
    MessageReadUpdate { message_id: String, user_id: Uuid },

    /// Edit rejected (outside the edit window)
    EditError { message: String },

    /// Request rejected (validation or authority)
    ActionError { kind: ActionKind, message: String },

    /// Private notice to a member removed from a room
    Kicked { room: String, by: String },

    PollStarted { poll: PollView },
    PollUpdated { poll: PollView },
    PollEnded { poll: PollView },

    Typing { username: String },
    StopTyping { username: String },

    /// Direct reply to a message search
    SearchResults { messages: Vec<Message> },
}

/// A delivery or scheduling instruction for the transport.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Deliver to a single connection
    ToConnection(Uuid, ServerEvent),

    /// Deliver to every connection currently in the room
    ToRoom(String, ServerEvent),

    /// Deliver to every connection in the room except one
    ToRoomExcept(String, Uuid, ServerEvent),

    /// Arm the auto-expiry timer for the room's active poll. Replaces any
    /// previous timer for the room.
    SchedulePollEnd {
        room: String,
        poll_id: String,
        after: Duration,
    },

    /// Disarm the room's poll timer, if any
    CancelPollEnd { room: String },

    /// The transport must forget the connection's remembered room (kick)
    DetachFromRoom { conn: Uuid },
}
