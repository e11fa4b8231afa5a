//! Poll model and vote bookkeeping

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One poll option with its running vote count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub text: String,
    pub count: u32,
}

/// The active poll of a room.
///
/// Deliberately not serializable: `votes_by_voter` must never reach a
/// client. The externally visible representation is [`PollView`].
#[derive(Debug, Clone)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub multiple: bool,
    pub started_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Identities that have voted, in voting order.
    pub voted: Vec<Uuid>,
    /// Who chose what. Server-internal only.
    pub(crate) votes_by_voter: HashMap<Uuid, Vec<usize>>,
}

/// The sanitized poll representation delivered to clients: everything a
/// member may see, minus the voter-to-choices mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub multiple: bool,
    pub started_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub voted_user_ids: Vec<Uuid>,
}

impl Poll {
    pub fn new(
        question: String,
        options: Vec<String>,
        multiple: bool,
        started_at: DateTime<Utc>,
        ends_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: format!("poll-{}", started_at.timestamp_millis()),
            question,
            options: options
                .into_iter()
                .map(|text| PollOption { text, count: 0 })
                .collect(),
            multiple,
            started_at,
            ends_at,
            voted: Vec::new(),
            votes_by_voter: HashMap::new(),
        }
    }

    pub fn has_voted(&self, voter: Uuid) -> bool {
        self.voted.contains(&voter)
    }

    /// Normalize a requested choice set: single-choice polls keep at most
    /// the first requested index, duplicates collapse, and out-of-range
    /// indexes are dropped. An empty result means the vote is invalid and
    /// the voter may retry.
    pub fn normalize_choices(&self, requested: &[i64]) -> Vec<usize> {
        let mut requested = requested.to_vec();
        if !self.multiple {
            requested.truncate(1);
        }

        let mut choices: Vec<usize> = Vec::new();
        for idx in requested {
            if idx < 0 || idx as usize >= self.options.len() {
                continue;
            }
            let idx = idx as usize;
            if !choices.contains(&idx) {
                choices.push(idx);
            }
        }
        choices
    }

    /// Record a vote. `choices` must come from [`Poll::normalize_choices`]
    /// and be non-empty.
    pub fn record_vote(&mut self, voter: Uuid, choices: &[usize]) {
        for &idx in choices {
            if let Some(option) = self.options.get_mut(idx) {
                option.count += 1;
            }
        }
        self.voted.push(voter);
        self.votes_by_voter.insert(voter, choices.to_vec());
    }

    /// The sanitized representation delivered to clients.
    pub fn view(&self) -> PollView {
        PollView {
            id: self.id.clone(),
            question: self.question.clone(),
            options: self.options.clone(),
            multiple: self.multiple,
            started_at: self.started_at,
            ends_at: self.ends_at,
            voted_user_ids: self.voted.clone(),
        }
    }
}
