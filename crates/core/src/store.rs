//! RoomStore - the in-memory session/room engine
//!
//! Owns every piece of per-room state (membership, message log, pinned
//! message, appearance, active poll) behind one service so lifecycle and
//! invariants are enforced in one place: rooms are created on first
//! reference and torn down when the last member leaves.
//!
//! Operations validate authority, mutate state, and return the delivery
//! [`Effect`]s for the transport to execute. The store never touches a
//! socket and never reads the clock; time-dependent operations take `now`
//! from the caller.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ActionKind, Error, Result};
use crate::events::{Effect, ServerEvent};
use crate::invariants;
use crate::mention::MentionScanner;
use crate::models::{Appearance, Member, Message, Poll, Theme};

/// Default edit window, in seconds.
///
/// The product copy advertises one minute but the enforced value has
/// always been five; kept as a single knob so a deployment can pick
/// either.
pub const DEFAULT_EDIT_WINDOW_SECS: u64 = 300;

/// All state belonging to one room. Dropped wholesale on teardown.
#[derive(Debug, Default)]
struct RoomState {
    members: Vec<Member>,
    messages: Vec<Message>,
    /// Frozen snapshot taken at pin time; survives deletion of the
    /// underlying message.
    pinned: Option<Message>,
    /// None until first access materializes the default.
    appearance: Option<Appearance>,
    poll: Option<Poll>,
}

impl RoomState {
    fn usernames(&self) -> Vec<String> {
        self.members.iter().map(|m| m.username.clone()).collect()
    }

    fn find_member(&self, conn: Uuid) -> Option<&Member> {
        self.members.iter().find(|m| m.id == conn)
    }
}

pub struct RoomStore {
    rooms: HashMap<String, RoomState>,
    mentions: MentionScanner,
    edit_window: Duration,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::with_edit_window(Duration::from_secs(DEFAULT_EDIT_WINDOW_SECS))
    }

    pub fn with_edit_window(edit_window: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            mentions: MentionScanner::new(),
            edit_window,
        }
    }

    /// Names of all current rooms.
    pub fn rooms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connection identities of a room's current members, for the
    /// transport to resolve room-scoped effects.
    pub fn room_conns(&self, room: &str) -> Vec<Uuid> {
        self.rooms
            .get(room)
            .map(|state| state.members.iter().map(|m| m.id).collect())
            .unwrap_or_default()
    }

    /// Add a member to a room, creating the room if absent. The first
    /// member of a fresh (or emptied) room becomes admin.
    pub fn join(&mut self, conn: Uuid, username: &str, room_name: &str) -> Result<Vec<Effect>> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::blank_username());
        }

        let room = room_name.to_lowercase();
        let state = self.rooms.entry(room.clone()).or_default();
        let first = state.members.is_empty();
        state.members.push(Member::new(conn, username.to_string(), first));
        Self::reaffirm_admin(&room, state);

        let mut effects = vec![
            Effect::ToConnection(conn, ServerEvent::UserId { id: conn }),
            Effect::ToRoom(
                room.clone(),
                ServerEvent::OnlineUsers {
                    usernames: state.usernames(),
                },
            ),
            Effect::ToRoom(
                room.clone(),
                ServerEvent::OnlineUsersWithIds {
                    members: state.members.clone(),
                },
            ),
            Effect::ToRoom(
                room.clone(),
                ServerEvent::System {
                    text: format!("{username} joined!"),
                },
            ),
            Effect::ToConnection(
                conn,
                ServerEvent::AllMessages {
                    messages: state.messages.clone(),
                },
            ),
            Effect::ToConnection(
                conn,
                ServerEvent::PinnedMessage {
                    message: state.pinned.clone(),
                },
            ),
        ];

        let appearance = state.appearance.get_or_insert_with(Appearance::default).clone();
        effects.push(Effect::ToConnection(
            conn,
            ServerEvent::RoomAppearance { appearance },
        ));
        effects.push(Effect::ToConnection(
            conn,
            ServerEvent::ActivePoll {
                poll: state.poll.as_ref().map(Poll::view),
            },
        ));

        invariants::assert_room_invariants(&room, &state.members);
        debug!(conn_id = %conn, username = %username, room = %room, "member joined");
        Ok(effects)
    }

    /// Remove a member on disconnect. Tears down the room's entire state
    /// when the last member leaves.
    pub fn leave(&mut self, conn: Uuid, room: &str) -> Vec<Effect> {
        let room = room.to_lowercase();
        let Some(state) = self.rooms.get_mut(&room) else {
            return Vec::new();
        };
        let Some(pos) = state.members.iter().position(|m| m.id == conn) else {
            return Vec::new();
        };
        let member = state.members.remove(pos);

        if state.members.is_empty() {
            self.rooms.remove(&room);
            debug!(room = %room, "last member left, tearing down room");
            return vec![Effect::CancelPollEnd { room }];
        }

        let mut effects = Vec::new();
        if let Some(promoted) = Self::reaffirm_admin(&room, state) {
            effects.push(Effect::ToRoom(
                room.clone(),
                ServerEvent::System {
                    text: format!("{promoted} is the new admin."),
                },
            ));
        }
        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::OnlineUsers {
                usernames: state.usernames(),
            },
        ));
        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::OnlineUsersWithIds {
                members: state.members.clone(),
            },
        ));
        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::System {
                text: format!("{} left.", member.username),
            },
        ));

        invariants::assert_room_invariants(&room, &state.members);
        effects
    }

    /// Remove another member from the room. Admin only; kicking yourself
    /// is rejected.
    pub fn kick(&mut self, requester: Uuid, room: &str, target: Uuid) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let by = Self::require_admin(state, requester, ActionKind::Kick, "do that")?;

        if target == requester {
            return Err(Error::Validation {
                action: ActionKind::Kick,
                message: "You cannot kick yourself.".to_string(),
            });
        }
        let Some(pos) = state.members.iter().position(|m| m.id == target) else {
            return Err(Error::NotFound(format!("member {target}")));
        };
        let kicked = state.members.remove(pos);

        let mut effects = vec![
            Effect::DetachFromRoom { conn: target },
            Effect::ToConnection(
                target,
                ServerEvent::Kicked {
                    room: room.clone(),
                    by,
                },
            ),
        ];

        if state.members.is_empty() {
            self.rooms.remove(&room);
            debug!(room = %room, "room emptied by kick, tearing down");
            effects.push(Effect::CancelPollEnd { room });
            return Ok(effects);
        }

        if let Some(promoted) = Self::reaffirm_admin(&room, state) {
            effects.push(Effect::ToRoom(
                room.clone(),
                ServerEvent::System {
                    text: format!("{promoted} is the new admin."),
                },
            ));
        }
        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::OnlineUsers {
                usernames: state.usernames(),
            },
        ));
        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::OnlineUsersWithIds {
                members: state.members.clone(),
            },
        ));
        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::System {
                text: format!("{} was kicked from the room.", kicked.username),
            },
        ));

        invariants::assert_room_invariants(&room, &state.members);
        debug!(room = %room, target = %target, "member kicked");
        Ok(effects)
    }

    /// Append a message and notify mentioned members. The sender must be
    /// a current member of the room.
    pub fn send_message(
        &mut self,
        conn: Uuid,
        room: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let Some(sender) = state.find_member(conn) else {
            return Ok(Vec::new());
        };

        let message = Message::new(conn, sender.username.clone(), text.to_string(), now);
        state.messages.push(message.clone());

        let mut effects = vec![Effect::ToRoom(room, ServerEvent::Chat { message })];
        for (member_id, token) in self.mentions.mentioned_members(text, &state.members, conn) {
            effects.push(Effect::ToConnection(
                member_id,
                ServerEvent::MentionNotify {
                    text: format!("You were mentioned in a message as @{token}!"),
                },
            ));
        }
        Ok(effects)
    }

    /// Add a member to a message's read set. Idempotent: a reader already
    /// recorded produces no broadcast.
    pub fn mark_read(&mut self, room: &str, message_id: &str, reader: Uuid) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(Error::NotFound(format!("message {message_id}")));
        };
        if message.read_by.contains(&reader) {
            return Ok(Vec::new());
        }
        message.read_by.push(reader);
        Ok(vec![Effect::ToRoom(
            room,
            ServerEvent::MessageReadUpdate {
                message_id: message_id.to_string(),
                user_id: reader,
            },
        )])
    }

    /// Replace a message's text. Author only, and only within the edit
    /// window measured from the creation timestamp (boundary inclusive).
    pub fn edit_message(
        &mut self,
        conn: Uuid,
        room: &str,
        message_id: &str,
        new_text: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let window_ms = self.edit_window.as_millis() as i64;
        let window_secs = self.edit_window.as_secs();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return Err(Error::NotFound(format!("message {message_id}")));
        };
        if message.user.id != conn {
            return Ok(Vec::new());
        }

        let elapsed = now.signed_duration_since(message.created_at);
        if elapsed.num_milliseconds() > window_ms {
            return Err(Error::EditWindowElapsed {
                elapsed_secs: elapsed.num_seconds(),
                window_secs,
            });
        }

        message.text = new_text.to_string();
        message.edited = true;
        message.edit_time = Some(now.format("%H:%M").to_string());

        Ok(vec![Effect::ToRoom(
            room,
            ServerEvent::AllMessages {
                messages: state.messages.clone(),
            },
        )])
    }

    /// Remove a message. Allowed for the author or the room's current
    /// admin; anyone else is a silent no-op.
    pub fn delete_message(
        &mut self,
        conn: Uuid,
        room: &str,
        message_id: &str,
    ) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let Some(pos) = state.messages.iter().position(|m| m.id == message_id) else {
            return Err(Error::NotFound(format!("message {message_id}")));
        };

        let admin = state
            .find_member(conn)
            .filter(|m| m.is_admin)
            .map(|m| m.username.clone());
        let is_author = state.messages[pos].user.id == conn;
        if !is_author && admin.is_none() {
            return Ok(Vec::new());
        }

        let removed = state.messages.remove(pos);
        let mut effects = vec![Effect::ToRoom(
            room.clone(),
            ServerEvent::AllMessages {
                messages: state.messages.clone(),
            },
        )];
        if let Some(by) = admin {
            if !is_author {
                effects.push(Effect::ToRoom(
                    room,
                    ServerEvent::System {
                        text: format!("{by} deleted a message from {}.", removed.user.username),
                    },
                ));
            }
        }
        Ok(effects)
    }

    /// Pin a message currently in the log. The pin keeps a frozen
    /// snapshot, so deleting the message later leaves the pin in place.
    pub fn pin_message(&mut self, room: &str, message_id: &str) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let Some(message) = state.messages.iter().find(|m| m.id == message_id) else {
            return Err(Error::NotFound(format!("message {message_id}")));
        };
        state.pinned = Some(message.clone());
        Ok(vec![Effect::ToRoom(
            room,
            ServerEvent::PinnedMessage {
                message: state.pinned.clone(),
            },
        )])
    }

    /// Clear the room's pin. Broadcasts once; unpinning an unpinned room
    /// is a no-op.
    pub fn unpin_message(&mut self, room: &str) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        if state.pinned.take().is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![Effect::ToRoom(
            room,
            ServerEvent::PinnedMessage { message: None },
        )])
    }

    /// Case-insensitive substring search over message text and author
    /// username. Direct reply to the requester; an unknown room yields an
    /// empty result.
    pub fn search(&self, conn: Uuid, room: &str, query: &str) -> Vec<Effect> {
        let room = room.to_lowercase();
        let needle = query.to_lowercase();
        let messages = self
            .rooms
            .get(&room)
            .map(|state| {
                state
                    .messages
                    .iter()
                    .filter(|m| m.matches(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        vec![Effect::ToConnection(
            conn,
            ServerEvent::SearchResults { messages },
        )]
    }

    /// Update the room's display configuration. Admin only.
    pub fn update_appearance(
        &mut self,
        requester: Uuid,
        room: &str,
        theme: Option<&str>,
        background_color: Option<String>,
    ) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        Self::require_admin(state, requester, ActionKind::Appearance, "do that")?;

        let appearance = Appearance {
            theme: Theme::from_client(theme.unwrap_or("")),
            background_color: background_color.filter(|c| !c.is_empty()),
        };
        state.appearance = Some(appearance.clone());
        Ok(vec![Effect::ToRoom(
            room,
            ServerEvent::RoomAppearance { appearance },
        )])
    }

    /// Start a poll. Admin only; one active poll per room.
    #[allow(clippy::too_many_arguments)]
    pub fn start_poll(
        &mut self,
        requester: Uuid,
        room: &str,
        question: &str,
        options: &[String],
        multiple: bool,
        duration_secs: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        Self::require_admin(state, requester, ActionKind::Poll, "start a poll")?;

        if state.poll.is_some() {
            return Err(Error::Validation {
                action: ActionKind::Poll,
                message: "A poll is already active.".to_string(),
            });
        }

        let question = question.trim();
        let options: Vec<String> = options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if question.is_empty() || options.len() < 2 {
            return Err(Error::Validation {
                action: ActionKind::Poll,
                message: "Provide a valid question and at least two options.".to_string(),
            });
        }

        let ends_at = duration_secs
            .filter(|d| d.is_finite() && *d > 0.0)
            .and_then(|d| now.checked_add_signed(chrono::Duration::milliseconds((d * 1000.0) as i64)));

        let poll = Poll::new(question.to_string(), options, multiple, now, ends_at);
        let view = poll.view();

        let mut effects = Vec::new();
        if let Some(ends_at) = ends_at {
            let after = ends_at.signed_duration_since(now).to_std().unwrap_or_default();
            effects.push(Effect::SchedulePollEnd {
                room: room.clone(),
                poll_id: poll.id.clone(),
                after,
            });
        }
        debug!(room = %room, poll_id = %poll.id, "poll started");
        state.poll = Some(poll);

        effects.push(Effect::ToRoom(
            room.clone(),
            ServerEvent::PollStarted { poll: view.clone() },
        ));
        effects.push(Effect::ToRoom(
            room,
            ServerEvent::ActivePoll { poll: Some(view) },
        ));
        Ok(effects)
    }

    /// Record a vote on the room's active poll. One vote per member; an
    /// invalid selection does not consume the member's vote.
    pub fn vote(&mut self, voter: Uuid, room: &str, option_indexes: &[i64]) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        let Some(poll) = state.poll.as_mut() else {
            return Err(Error::Validation {
                action: ActionKind::Poll,
                message: "There is no active poll.".to_string(),
            });
        };
        if poll.has_voted(voter) {
            return Err(Error::Validation {
                action: ActionKind::Poll,
                message: "You have already voted in this poll.".to_string(),
            });
        }

        let choices = poll.normalize_choices(option_indexes);
        if choices.is_empty() {
            return Err(Error::Validation {
                action: ActionKind::Poll,
                message: "Select a valid option.".to_string(),
            });
        }

        poll.record_vote(voter, &choices);
        invariants::assert_poll_invariants(poll);
        Ok(vec![Effect::ToRoom(
            room,
            ServerEvent::PollUpdated { poll: poll.view() },
        )])
    }

    /// End the room's poll early. Admin only; ending when no poll is
    /// active is a no-op.
    pub fn end_poll(&mut self, requester: Uuid, room: &str) -> Result<Vec<Effect>> {
        let room = room.to_lowercase();
        let state = self
            .rooms
            .get_mut(&room)
            .ok_or_else(|| Error::NotFound(format!("room {room}")))?;
        Self::require_admin(state, requester, ActionKind::Poll, "end the poll")?;

        let Some(poll) = state.poll.take() else {
            return Ok(Vec::new());
        };
        debug!(room = %room, poll_id = %poll.id, "poll ended manually");
        Ok(vec![
            Effect::CancelPollEnd { room: room.clone() },
            Effect::ToRoom(room, ServerEvent::PollEnded { poll: poll.view() }),
        ])
    }

    /// Timer callback for poll auto-expiry. The poll may have been ended
    /// manually, replaced, or torn down with its room since the timer was
    /// armed, so both the room and the poll id are re-checked; a stale
    /// firing is a no-op.
    pub fn poll_expired(&mut self, room: &str, poll_id: &str) -> Vec<Effect> {
        let Some(state) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        match &state.poll {
            Some(active) if active.id == poll_id => {}
            _ => return Vec::new(),
        }
        let Some(poll) = state.poll.take() else {
            return Vec::new();
        };
        debug!(room = %room, poll_id = %poll_id, "poll expired");
        vec![Effect::ToRoom(
            room.to_string(),
            ServerEvent::PollEnded { poll: poll.view() },
        )]
    }

    /// Restore the single-admin invariant after a membership mutation:
    /// when no member holds admin, promote the first. Idempotent. Returns
    /// the promoted username, if a promotion happened.
    fn reaffirm_admin(room: &str, state: &mut RoomState) -> Option<String> {
        if state.members.is_empty() || state.members.iter().any(|m| m.is_admin) {
            return None;
        }
        state.members[0].is_admin = true;
        debug!(room = %room, username = %state.members[0].username, "promoted new admin");
        Some(state.members[0].username.clone())
    }

    fn require_admin(
        state: &RoomState,
        conn: Uuid,
        action: ActionKind,
        what: &str,
    ) -> Result<String> {
        match state.find_member(conn) {
            Some(m) if m.is_admin => Ok(m.username.clone()),
            _ => Err(Error::Authority {
                action,
                message: format!("You are not allowed to {what}."),
            }),
        }
    }
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Uuid {
        Uuid::new_v4()
    }

    fn join(store: &mut RoomStore, conn: Uuid, username: &str, room: &str) -> Vec<Effect> {
        store.join(conn, username, room).unwrap()
    }

    /// Events delivered privately to `conn`.
    fn to_conn(effects: &[Effect], conn: Uuid) -> Vec<&ServerEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::ToConnection(c, ev) if *c == conn => Some(ev),
                _ => None,
            })
            .collect()
    }

    /// Events broadcast to any room.
    fn to_room(effects: &[Effect]) -> Vec<&ServerEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::ToRoom(_, ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    fn members_of<'a>(store: &'a RoomStore, room: &str) -> &'a [Member] {
        &store.rooms[room].members
    }

    fn admin_count(store: &RoomStore, room: &str) -> usize {
        members_of(store, room).iter().filter(|m| m.is_admin).count()
    }

    #[test]
    fn test_first_member_becomes_admin() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let members = members_of(&store, "general");
        assert!(members[0].is_admin);
        assert!(!members[1].is_admin);
    }

    #[test]
    fn test_blank_username_rejected_without_state_change() {
        let mut store = RoomStore::new();
        let err = store.join(conn(), "   ", "general").unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                action: ActionKind::Username,
                ..
            }
        ));
        assert!(store.rooms().is_empty());
    }

    #[test]
    fn test_room_names_are_case_folded() {
        let mut store = RoomStore::new();
        join(&mut store, conn(), "alice", "General");
        join(&mut store, conn(), "bob", "GENERAL");

        assert_eq!(store.rooms(), vec!["general".to_string()]);
        assert_eq!(members_of(&store, "general").len(), 2);
    }

    #[test]
    fn test_join_delivers_identity_and_room_snapshot() {
        let mut store = RoomStore::new();
        let a = conn();
        let effects = join(&mut store, a, "alice", "general");

        // Identity goes out before anything else.
        assert!(matches!(
            effects[0],
            Effect::ToConnection(c, ServerEvent::UserId { id }) if c == a && id == a
        ));

        let private = to_conn(&effects, a);
        assert!(private
            .iter()
            .any(|ev| matches!(ev, ServerEvent::AllMessages { messages } if messages.is_empty())));
        assert!(private
            .iter()
            .any(|ev| matches!(ev, ServerEvent::PinnedMessage { message: None })));
        assert!(private.iter().any(|ev| matches!(
            ev,
            ServerEvent::RoomAppearance { appearance }
                if appearance.theme == Theme::Dark && appearance.background_color.is_none()
        )));
        assert!(private
            .iter()
            .any(|ev| matches!(ev, ServerEvent::ActivePoll { poll: None })));
    }

    #[test]
    fn test_leave_promotes_first_remaining_member() {
        let mut store = RoomStore::new();
        let (a, b, c) = (conn(), conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        join(&mut store, c, "carol", "general");

        let effects = store.leave(a, "general");

        let members = members_of(&store, "general");
        assert_eq!(members.len(), 2);
        assert!(members[0].is_admin);
        assert_eq!(members[0].username, "bob");
        assert!(to_room(&effects)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::System { text } if text == "bob is the new admin.")));
        assert!(to_room(&effects)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::System { text } if text == "alice left.")));
    }

    #[test]
    fn test_last_leave_tears_down_all_room_state() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        store
            .send_message(a, "general", "hello", Utc::now())
            .unwrap();
        store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap();

        let effects = store.leave(a, "general");

        assert!(store.rooms().is_empty());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelPollEnd { room } if room == "general")));

        // A fresh join sees none of the old state.
        let effects = join(&mut store, conn(), "bob", "general");
        let private = to_conn(&effects, members_of(&store, "general")[0].id);
        assert!(private
            .iter()
            .any(|ev| matches!(ev, ServerEvent::AllMessages { messages } if messages.is_empty())));
        assert!(private
            .iter()
            .any(|ev| matches!(ev, ServerEvent::ActivePoll { poll: None })));
    }

    #[test]
    fn test_kick_requires_admin() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let err = store.kick(b, "general", a).unwrap_err();
        assert!(matches!(
            err,
            Error::Authority {
                action: ActionKind::Kick,
                ..
            }
        ));
        assert_eq!(members_of(&store, "general").len(), 2);
    }

    #[test]
    fn test_kick_self_rejected() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let err = store.kick(a, "general", a).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                action: ActionKind::Kick,
                ..
            }
        ));
        assert_eq!(members_of(&store, "general").len(), 1);
    }

    #[test]
    fn test_kick_missing_target_is_not_found() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let err = store.kick(a, "general", conn()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(members_of(&store, "general").len(), 1);
    }

    #[test]
    fn test_kick_scenario_admin_removes_member() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let effects = store.kick(a, "general", b).unwrap();

        let members = members_of(&store, "general");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "alice");
        assert!(members[0].is_admin);

        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::DetachFromRoom { conn } if *conn == b)));
        assert!(to_conn(&effects, b).iter().any(|ev| matches!(
            ev,
            ServerEvent::Kicked { room, by } if room == "general" && by == "alice"
        )));
        assert!(to_room(&effects).iter().any(|ev| matches!(
            ev,
            ServerEvent::System { text } if text == "bob was kicked from the room."
        )));
    }

    #[test]
    fn test_single_admin_invariant_across_membership_churn() {
        let mut store = RoomStore::new();
        let (a, b, c, d) = (conn(), conn(), conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        join(&mut store, c, "carol", "general");
        assert_eq!(admin_count(&store, "general"), 1);

        store.leave(a, "general");
        assert_eq!(admin_count(&store, "general"), 1);

        join(&mut store, d, "dave", "general");
        assert_eq!(admin_count(&store, "general"), 1);

        // bob is now admin; kick carol
        store.kick(b, "general", c).unwrap();
        assert_eq!(admin_count(&store, "general"), 1);

        store.leave(b, "general");
        assert_eq!(admin_count(&store, "general"), 1);
        assert!(members_of(&store, "general")[0].is_admin);
    }

    #[test]
    fn test_send_appends_and_broadcasts() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let effects = store
            .send_message(a, "general", "hello", Utc::now())
            .unwrap();

        assert_eq!(store.rooms["general"].messages.len(), 1);
        let msg = &store.rooms["general"].messages[0];
        assert_eq!(msg.read_by, vec![a]);
        assert!(to_room(&effects)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::Chat { message } if message.text == "hello")));
    }

    #[test]
    fn test_send_from_non_member_is_a_no_op() {
        let mut store = RoomStore::new();
        join(&mut store, conn(), "alice", "general");

        let effects = store
            .send_message(conn(), "general", "ghost", Utc::now())
            .unwrap();
        assert!(effects.is_empty());
        assert!(store.rooms["general"].messages.is_empty());
    }

    #[test]
    fn test_mention_notifies_member_once() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let effects = store
            .send_message(a, "general", "@bob hey @BOB, also @carol and @alice", Utc::now())
            .unwrap();

        let notifications: Vec<_> = effects
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Effect::ToConnection(_, ServerEvent::MentionNotify { .. })
                )
            })
            .collect();
        assert_eq!(notifications.len(), 1);
        assert!(matches!(
            notifications[0],
            Effect::ToConnection(c, _) if *c == b
        ));
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        store
            .send_message(a, "general", "hello", Utc::now())
            .unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let effects = store.mark_read("general", &id, b).unwrap();
        assert_eq!(effects.len(), 1);

        let again = store.mark_read("general", &id, b).unwrap();
        assert!(again.is_empty());
        assert_eq!(store.rooms["general"].messages[0].read_by.len(), 2);
    }

    #[test]
    fn test_edit_accepted_exactly_at_window_boundary() {
        let mut store = RoomStore::with_edit_window(Duration::from_secs(60));
        let a = conn();
        join(&mut store, a, "alice", "general");

        let t0 = Utc::now();
        store.send_message(a, "general", "first", t0).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let effects = store
            .edit_message(a, "general", &id, "second", t0 + chrono::Duration::seconds(60))
            .unwrap();

        let msg = &store.rooms["general"].messages[0];
        assert_eq!(msg.text, "second");
        assert!(msg.edited);
        assert!(msg.edit_time.is_some());
        assert!(to_room(&effects)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::AllMessages { .. })));
    }

    #[test]
    fn test_edit_rejected_one_second_past_the_window() {
        let mut store = RoomStore::with_edit_window(Duration::from_secs(60));
        let a = conn();
        join(&mut store, a, "alice", "general");

        let t0 = Utc::now();
        store.send_message(a, "general", "first", t0).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let err = store
            .edit_message(a, "general", &id, "second", t0 + chrono::Duration::seconds(61))
            .unwrap_err();

        assert!(matches!(
            err,
            Error::EditWindowElapsed {
                elapsed_secs: 61,
                window_secs: 60
            }
        ));
        assert_eq!(store.rooms["general"].messages[0].text, "first");
    }

    #[test]
    fn test_edit_by_non_author_is_a_no_op() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let t0 = Utc::now();
        store.send_message(a, "general", "mine", t0).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let effects = store.edit_message(b, "general", &id, "hijacked", t0).unwrap();
        assert!(effects.is_empty());
        assert_eq!(store.rooms["general"].messages[0].text, "mine");
    }

    #[test]
    fn test_delete_by_author_broadcasts_updated_log() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        store.send_message(a, "general", "oops", Utc::now()).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let effects = store.delete_message(a, "general", &id).unwrap();

        assert!(store.rooms["general"].messages.is_empty());
        let room_events = to_room(&effects);
        assert!(room_events
            .iter()
            .any(|ev| matches!(ev, ServerEvent::AllMessages { messages } if messages.is_empty())));
        // Author deleting their own message produces no system notice.
        assert!(!room_events
            .iter()
            .any(|ev| matches!(ev, ServerEvent::System { .. })));
    }

    #[test]
    fn test_admin_delete_of_foreign_message_announces() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        store.send_message(b, "general", "spam", Utc::now()).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let effects = store.delete_message(a, "general", &id).unwrap();

        assert!(to_room(&effects).iter().any(|ev| matches!(
            ev,
            ServerEvent::System { text } if text == "alice deleted a message from bob."
        )));
    }

    #[test]
    fn test_delete_by_bystander_is_a_no_op() {
        let mut store = RoomStore::new();
        let (a, b, c) = (conn(), conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        join(&mut store, c, "carol", "general");
        store.send_message(b, "general", "keep me", Utc::now()).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        let effects = store.delete_message(c, "general", &id).unwrap();
        assert!(effects.is_empty());
        assert_eq!(store.rooms["general"].messages.len(), 1);
    }

    #[test]
    fn test_deleted_message_leaves_search_and_its_id_is_not_reused() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let t0 = Utc::now();
        store.send_message(a, "general", "first post", t0).unwrap();
        let first_id = store.rooms["general"].messages[0].id.clone();
        store.delete_message(a, "general", &first_id).unwrap();

        store
            .send_message(a, "general", "second post", t0 + chrono::Duration::seconds(1))
            .unwrap();
        let second_id = store.rooms["general"].messages[0].id.clone();
        assert_ne!(first_id, second_id);

        let effects = store.search(a, "general", "post");
        let Effect::ToConnection(_, ServerEvent::SearchResults { messages }) = &effects[0] else {
            panic!("expected search results");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, second_id);
    }

    #[test]
    fn test_pin_keeps_a_snapshot_that_survives_delete() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        store.send_message(a, "general", "important", Utc::now()).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();

        store.pin_message("general", &id).unwrap();
        store.delete_message(a, "general", &id).unwrap();

        let pinned = store.rooms["general"].pinned.as_ref().unwrap();
        assert_eq!(pinned.id, id);
        assert_eq!(pinned.text, "important");
    }

    #[test]
    fn test_unpin_broadcasts_none_once() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        store.send_message(a, "general", "pin me", Utc::now()).unwrap();
        let id = store.rooms["general"].messages[0].id.clone();
        store.pin_message("general", &id).unwrap();

        let effects = store.unpin_message("general").unwrap();
        assert!(to_room(&effects)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::PinnedMessage { message: None })));

        let again = store.unpin_message("general").unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_pin_missing_message_is_not_found() {
        let mut store = RoomStore::new();
        join(&mut store, conn(), "alice", "general");
        let err = store.pin_message("general", "nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_search_matches_text_and_username_case_insensitively() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "Alice", "general");
        join(&mut store, b, "bob", "general");
        store.send_message(a, "general", "Hello World", Utc::now()).unwrap();
        store.send_message(b, "general", "unrelated", Utc::now()).unwrap();

        let by_text = store.search(a, "general", "WORLD");
        let Effect::ToConnection(_, ServerEvent::SearchResults { messages }) = &by_text[0] else {
            panic!("expected search results");
        };
        assert_eq!(messages.len(), 1);

        let by_author = store.search(a, "general", "alice");
        let Effect::ToConnection(_, ServerEvent::SearchResults { messages }) = &by_author[0] else {
            panic!("expected search results");
        };
        assert_eq!(messages.len(), 1);

        let unknown_room = store.search(a, "nowhere", "anything");
        let Effect::ToConnection(_, ServerEvent::SearchResults { messages }) = &unknown_room[0]
        else {
            panic!("expected search results");
        };
        assert!(messages.is_empty());
    }

    #[test]
    fn test_start_poll_requires_admin() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let err = store
            .start_poll(
                b,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Authority {
                action: ActionKind::Poll,
                ..
            }
        ));
    }

    #[test]
    fn test_start_poll_validates_question_and_options() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let err = store
            .start_poll(
                a,
                "general",
                "   ",
                &["x".to_string(), "y".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        // Whitespace-only options are discarded before the count check.
        let err = store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "   ".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(store.rooms["general"].poll.is_none());
    }

    #[test]
    fn test_start_poll_while_active_leaves_existing_poll_untouched() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        store
            .start_poll(
                a,
                "general",
                "first?",
                &["x".to_string(), "y".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap();
        store.vote(b, "general", &[0]).unwrap();

        let err = store
            .start_poll(
                a,
                "general",
                "second?",
                &["p".to_string(), "q".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let poll = store.rooms["general"].poll.as_ref().unwrap();
        assert_eq!(poll.question, "first?");
        assert_eq!(poll.options[0].count, 1);
    }

    #[test]
    fn test_start_poll_with_duration_schedules_expiry() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let now = Utc::now();
        let effects = store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                Some(5.0),
                now,
            )
            .unwrap();

        let poll_id = store.rooms["general"].poll.as_ref().unwrap().id.clone();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::SchedulePollEnd { room, poll_id: id, after }
                if room == "general" && *id == poll_id && *after == Duration::from_secs(5)
        )));
        assert_eq!(
            store.rooms["general"].poll.as_ref().unwrap().ends_at,
            Some(now + chrono::Duration::seconds(5))
        );
    }

    #[test]
    fn test_start_poll_without_duration_never_expires() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");

        let effects = store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                Some(f64::INFINITY),
                Utc::now(),
            )
            .unwrap();

        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::SchedulePollEnd { .. })));
        assert!(store.rooms["general"].poll.as_ref().unwrap().ends_at.is_none());
    }

    #[test]
    fn test_vote_requires_active_poll_and_allows_retry_after_invalid_selection() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let err = store.vote(b, "general", &[0]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap();

        // Out-of-range selection fails without consuming the vote.
        let err = store.vote(b, "general", &[9]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!store.rooms["general"].poll.as_ref().unwrap().has_voted(b));

        store.vote(b, "general", &[1]).unwrap();
        let poll = store.rooms["general"].poll.as_ref().unwrap();
        assert_eq!(poll.options[1].count, 1);
        assert!(poll.has_voted(b));
    }

    #[test]
    fn test_second_vote_rejected() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");
        store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                None,
                Utc::now(),
            )
            .unwrap();

        store.vote(b, "general", &[0]).unwrap();
        let err = store.vote(b, "general", &[1]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let poll = store.rooms["general"].poll.as_ref().unwrap();
        assert_eq!(poll.options[0].count, 1);
        assert_eq!(poll.options[1].count, 0);
        assert_eq!(poll.voted.len(), 1);
    }

    #[test]
    fn test_manual_end_and_timer_fire_produce_one_ended_broadcast() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                Some(5.0),
                Utc::now(),
            )
            .unwrap();
        let poll_id = store.rooms["general"].poll.as_ref().unwrap().id.clone();

        // Manual end wins; the later timer fire is a no-op.
        let effects = store.end_poll(a, "general").unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelPollEnd { .. })));
        assert_eq!(
            to_room(&effects)
                .iter()
                .filter(|ev| matches!(ev, ServerEvent::PollEnded { .. }))
                .count(),
            1
        );

        assert!(store.poll_expired("general", &poll_id).is_empty());
        // And ending again is a no-op too.
        assert!(store.end_poll(a, "general").unwrap().is_empty());
    }

    #[test]
    fn test_timer_fire_then_manual_end_is_a_no_op() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        store
            .start_poll(
                a,
                "general",
                "q?",
                &["x".to_string(), "y".to_string()],
                false,
                Some(5.0),
                Utc::now(),
            )
            .unwrap();
        let poll_id = store.rooms["general"].poll.as_ref().unwrap().id.clone();

        let effects = store.poll_expired("general", &poll_id);
        assert_eq!(
            to_room(&effects)
                .iter()
                .filter(|ev| matches!(ev, ServerEvent::PollEnded { .. }))
                .count(),
            1
        );
        assert!(store.end_poll(a, "general").unwrap().is_empty());
    }

    #[test]
    fn test_stale_timer_for_replaced_poll_is_ignored() {
        let mut store = RoomStore::new();
        let a = conn();
        join(&mut store, a, "alice", "general");
        let t0 = Utc::now();
        store
            .start_poll(
                a,
                "general",
                "first?",
                &["x".to_string(), "y".to_string()],
                false,
                Some(5.0),
                t0,
            )
            .unwrap();
        let old_id = store.rooms["general"].poll.as_ref().unwrap().id.clone();

        store.end_poll(a, "general").unwrap();
        store
            .start_poll(
                a,
                "general",
                "second?",
                &["x".to_string(), "y".to_string()],
                false,
                Some(5.0),
                t0 + chrono::Duration::seconds(1),
            )
            .unwrap();

        // The old poll's timer firing must not end the new poll.
        assert!(store.poll_expired("general", &old_id).is_empty());
        assert!(store.rooms["general"].poll.is_some());
    }

    #[test]
    fn test_timed_single_choice_poll_runs_to_expiry() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let t0 = Utc::now();
        let effects = store
            .start_poll(
                a,
                "general",
                "color?",
                &["red".to_string(), "blue".to_string()],
                false,
                Some(5.0),
                t0,
            )
            .unwrap();
        assert!(to_room(&effects)
            .iter()
            .any(|ev| matches!(ev, ServerEvent::PollStarted { .. })));

        store.vote(b, "general", &[0]).unwrap();

        let poll_id = store.rooms["general"].poll.as_ref().unwrap().id.clone();
        let effects = store.poll_expired("general", &poll_id);
        let ended = to_room(&effects)
            .into_iter()
            .find_map(|ev| match ev {
                ServerEvent::PollEnded { poll } => Some(poll.clone()),
                _ => None,
            })
            .expect("poll ended broadcast");
        assert_eq!(ended.options[0].count, 1);
        assert_eq!(ended.options[1].count, 0);
        assert_eq!(ended.voted_user_ids, vec![b]);

        // No vote is accepted after expiry.
        let err = store.vote(a, "general", &[1]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_appearance_update_is_admin_only_and_coerces_theme() {
        let mut store = RoomStore::new();
        let (a, b) = (conn(), conn());
        join(&mut store, a, "alice", "general");
        join(&mut store, b, "bob", "general");

        let err = store
            .update_appearance(b, "general", Some("light"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Authority {
                action: ActionKind::Appearance,
                ..
            }
        ));

        let effects = store
            .update_appearance(a, "general", Some("light"), Some("#223344".to_string()))
            .unwrap();
        assert!(to_room(&effects).iter().any(|ev| matches!(
            ev,
            ServerEvent::RoomAppearance { appearance }
                if appearance.theme == Theme::Light
                    && appearance.background_color.as_deref() == Some("#223344")
        )));

        // Unknown themes fall back to dark, empty colors clear.
        store
            .update_appearance(a, "general", Some("neon"), Some(String::new()))
            .unwrap();
        let appearance = store.rooms["general"].appearance.as_ref().unwrap();
        assert_eq!(appearance.theme, Theme::Dark);
        assert!(appearance.background_color.is_none());
    }
}
