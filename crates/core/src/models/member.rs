//! Room membership model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A connection's participation record in a room.
///
/// The id is the opaque per-connection identity assigned by the transport;
/// the username is fixed at join time for that connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: Uuid,
    pub username: String,
    pub is_admin: bool,
}

impl Member {
    pub fn new(id: Uuid, username: String, is_admin: bool) -> Self {
        Self {
            id,
            username,
            is_admin,
        }
    }
}
