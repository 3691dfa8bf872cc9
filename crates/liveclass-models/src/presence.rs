use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Instructor,
    Participant,
}

impl Role {
    pub fn from_instructor_flag(is_instructor: bool) -> Self {
        if is_instructor {
            Role::Instructor
        } else {
            Role::Participant
        }
    }

    pub fn is_instructor(self) -> bool {
        matches!(self, Role::Instructor)
    }
}

/// Who is behind a connection, as last declared by `join-room`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
}

/// Identity-only payload of `user-joined` / `user-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub is_instructor: bool,
}

impl PeerInfo {
    pub fn new(session_id: &str, identity: &Identity) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            is_instructor: identity.role.is_instructor(),
        }
    }
}

/// One entry of the `participants` projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub is_instructor: bool,
    /// Absent when the user has no avatar or the lookup failed; clients
    /// render a default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    pub hand_raised: bool,
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaisedHand {
    pub user_id: String,
    pub user_name: String,
}
