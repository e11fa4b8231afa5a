//! Mention detection for outgoing messages

use regex::Regex;
use uuid::Uuid;

use crate::models::Member;

/// Scans message text for `@username` tokens and resolves them against a
/// room's current membership.
pub struct MentionScanner {
    pattern: Regex,
}

impl MentionScanner {
    pub fn new() -> Self {
        // `\w` is Unicode-aware, so accented usernames match too.
        Self {
            pattern: Regex::new(r"@(\w+)").expect("mention pattern is valid"),
        }
    }

    /// Members mentioned in `text`, excluding the sender, each at most
    /// once per message. Usernames are compared case-insensitively. Each
    /// hit carries the token as the author typed it, for the notification
    /// text.
    pub fn mentioned_members(
        &self,
        text: &str,
        members: &[Member],
        sender: Uuid,
    ) -> Vec<(Uuid, String)> {
        let mut notified: Vec<Uuid> = Vec::new();
        let mut hits = Vec::new();

        for cap in self.pattern.captures_iter(text) {
            let token = &cap[1];
            let Some(member) = members
                .iter()
                .find(|m| m.username.to_lowercase() == token.to_lowercase())
            else {
                continue;
            };
            if member.id == sender || notified.contains(&member.id) {
                continue;
            }
            notified.push(member.id);
            hits.push((member.id, token.to_string()));
        }
        hits
    }
}

impl Default for MentionScanner {
    fn default() -> Self {
        Self::new()
    }
}
