//! Error types for the room engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which client action an error belongs to.
///
/// Mirrored into `actionError` payloads so clients can route the message
/// to the right piece of UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Username,
    Kick,
    Appearance,
    Poll,
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request payload. Reported to the requester only.
    #[error("{message}")]
    Validation { action: ActionKind, message: String },

    /// Requester lacks admin authority. Reported to the requester only.
    #[error("{message}")]
    Authority { action: ActionKind, message: String },

    /// Operation targeted a missing room/message/poll. Silently dropped
    /// by the dispatcher.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Edit attempted outside the allowed window. The message is left
    /// unmodified.
    #[error("Too late to edit this message: {elapsed_secs}s elapsed, window is {window_secs}s")]
    EditWindowElapsed { elapsed_secs: i64, window_secs: u64 },
}

impl Error {
    /// The blank-username rejection shared by join and chat-message
    /// handling. Delivered as a system notice, not an `actionError`.
    pub fn blank_username() -> Self {
        Error::Validation {
            action: ActionKind::Username,
            message: "Please set a valid username!".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
