//! Message model for room chat

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author info captured on a message at send time.
///
/// Captured rather than referenced: the author may leave the room (or be
/// kicked) while the message stays in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: Uuid,
    pub username: String,
}

/// A chat message in a room's ordered log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique within the room's history, derived from the sender's
    /// connection identity and the creation timestamp. Never reused,
    /// even after deletion.
    pub id: String,
    pub user: Author,
    pub text: String,
    /// Display time, `%H:%M`
    pub time: String,
    pub created_at: DateTime<Utc>,
    /// Connection identities that have read this message. The sender is
    /// recorded at creation.
    pub read_by: Vec<Uuid>,
    pub edited: bool,
    /// Display time of the last edit, `%H:%M`
    pub edit_time: Option<String>,
}

impl Message {
    pub fn new(sender: Uuid, username: String, text: String, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{sender}-{}", now.timestamp_millis()),
            user: Author {
                id: sender,
                username,
            },
            text,
            time: now.format("%H:%M").to_string(),
            created_at: now,
            read_by: vec![sender],
            edited: false,
            edit_time: None,
        }
    }

    /// Case-insensitive substring match against text and author username.
    /// `needle` must already be lowercased.
    pub fn matches(&self, needle: &str) -> bool {
        self.text.to_lowercase().contains(needle)
            || self.user.username.to_lowercase().contains(needle)
    }
}
