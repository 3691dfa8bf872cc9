use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::poll::PollDraft;

// Client -> Server events
pub const EVENT_JOIN_ROOM: &str = "join-room";
pub const EVENT_LEAVE_ROOM: &str = "leave-room";
pub const EVENT_LAUNCH_POLL: &str = "launch-poll";
pub const EVENT_VOTE_POLL: &str = "vote-poll";
pub const EVENT_END_POLL: &str = "end-poll";
pub const EVENT_RAISE_HAND: &str = "raise-hand";
pub const EVENT_LOWER_HAND: &str = "lower-hand";
pub const EVENT_SEND_REACTION: &str = "send-reaction";
pub const EVENT_MUTE_ALL: &str = "mute-all";
pub const EVENT_UNMUTE_ALL: &str = "unmute-all";
pub const EVENT_MUTE_USER: &str = "mute-user";
pub const EVENT_UNMUTE_USER: &str = "unmute-user";
pub const EVENT_REQUEST_UNMUTE: &str = "request-unmute";

// Events relayed or echoed under the same name in both directions
pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_ICE_CANDIDATE: &str = "ice-candidate";
pub const EVENT_CHAT_MESSAGE: &str = "chat-message";
pub const EVENT_WHITEBOARD_UPDATE: &str = "whiteboard-update";
pub const EVENT_WHITEBOARD_CLEAR: &str = "whiteboard-clear";
pub const EVENT_WHITEBOARD_OPENED: &str = "whiteboard-opened";
pub const EVENT_WHITEBOARD_SCENE_UPDATE: &str = "whiteboard-scene-update";

// Server -> Client events
pub const EVENT_PARTICIPANTS: &str = "participants";
pub const EVENT_USER_JOINED: &str = "user-joined";
pub const EVENT_USER_LEFT: &str = "user-left";
pub const EVENT_POLL_LAUNCHED: &str = "poll-launched";
pub const EVENT_POLL_UPDATED: &str = "poll-updated";
pub const EVENT_POLL_ENDED: &str = "poll-ended";
pub const EVENT_HANDS_UPDATED: &str = "hands-updated";
pub const EVENT_SHOW_REACTION: &str = "show-reaction";
pub const EVENT_MUTED_USERS: &str = "muted-users";
pub const EVENT_UNMUTE_REQUESTED: &str = "unmute-requested";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid event frame: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("event {0} has an empty roomId")]
    EmptyRoomId(&'static str),
}

/// Every event a client may send, validated at the gateway boundary.
///
/// Frames look like `{"event": "join-room", "data": {...}}`. Unknown event
/// names, missing fields and mistyped fields all fail to parse.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    LeaveRoom(RoomRef),
    Offer(Signal),
    Answer(Signal),
    IceCandidate(Signal),
    LaunchPoll(LaunchPoll),
    VotePoll(VotePoll),
    EndPoll(RoomRef),
    RaiseHand(HandSignal),
    LowerHand(HandSignal),
    SendReaction(Reaction),
    WhiteboardUpdate(WhiteboardData),
    WhiteboardClear(RoomRef),
    WhiteboardOpened(RoomRef),
    WhiteboardSceneUpdate(SceneUpdate),
    MuteAll(RoomRef),
    UnmuteAll(RoomRef),
    MuteUser(UserTarget),
    UnmuteUser(UserTarget),
    RequestUnmute(UnmuteRequest),
    ChatMessage(ChatMessage),
}

impl ClientEvent {
    /// Parse a text frame and reject events that name an empty room.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let event: ClientEvent = serde_json::from_str(text)?;
        if event.room_id().trim().is_empty() {
            return Err(ParseError::EmptyRoomId(event.name()));
        }
        Ok(event)
    }

    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::JoinRoom(e) => &e.room_id,
            ClientEvent::LeaveRoom(e)
            | ClientEvent::EndPoll(e)
            | ClientEvent::WhiteboardClear(e)
            | ClientEvent::WhiteboardOpened(e)
            | ClientEvent::MuteAll(e)
            | ClientEvent::UnmuteAll(e) => &e.room_id,
            ClientEvent::Offer(e) | ClientEvent::Answer(e) | ClientEvent::IceCandidate(e) => {
                &e.room_id
            }
            ClientEvent::LaunchPoll(e) => &e.room_id,
            ClientEvent::VotePoll(e) => &e.room_id,
            ClientEvent::RaiseHand(e) | ClientEvent::LowerHand(e) => &e.room_id,
            ClientEvent::SendReaction(e) => &e.room_id,
            ClientEvent::WhiteboardUpdate(e) => &e.room_id,
            ClientEvent::WhiteboardSceneUpdate(e) => &e.room_id,
            ClientEvent::MuteUser(e) | ClientEvent::UnmuteUser(e) => &e.room_id,
            ClientEvent::RequestUnmute(e) => &e.room_id,
            ClientEvent::ChatMessage(e) => &e.room_id,
        }
    }

    /// Wire name of the event, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => EVENT_JOIN_ROOM,
            ClientEvent::LeaveRoom(_) => EVENT_LEAVE_ROOM,
            ClientEvent::Offer(_) => EVENT_OFFER,
            ClientEvent::Answer(_) => EVENT_ANSWER,
            ClientEvent::IceCandidate(_) => EVENT_ICE_CANDIDATE,
            ClientEvent::LaunchPoll(_) => EVENT_LAUNCH_POLL,
            ClientEvent::VotePoll(_) => EVENT_VOTE_POLL,
            ClientEvent::EndPoll(_) => EVENT_END_POLL,
            ClientEvent::RaiseHand(_) => EVENT_RAISE_HAND,
            ClientEvent::LowerHand(_) => EVENT_LOWER_HAND,
            ClientEvent::SendReaction(_) => EVENT_SEND_REACTION,
            ClientEvent::WhiteboardUpdate(_) => EVENT_WHITEBOARD_UPDATE,
            ClientEvent::WhiteboardClear(_) => EVENT_WHITEBOARD_CLEAR,
            ClientEvent::WhiteboardOpened(_) => EVENT_WHITEBOARD_OPENED,
            ClientEvent::WhiteboardSceneUpdate(_) => EVENT_WHITEBOARD_SCENE_UPDATE,
            ClientEvent::MuteAll(_) => EVENT_MUTE_ALL,
            ClientEvent::UnmuteAll(_) => EVENT_UNMUTE_ALL,
            ClientEvent::MuteUser(_) => EVENT_MUTE_USER,
            ClientEvent::UnmuteUser(_) => EVENT_UNMUTE_USER,
            ClientEvent::RequestUnmute(_) => EVENT_REQUEST_UNMUTE,
            ClientEvent::ChatMessage(_) => EVENT_CHAT_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub is_instructor: bool,
}

/// Offer, answer or ICE candidate. `payload` is never inspected.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub room_id: String,
    pub payload: Value,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchPoll {
    pub room_id: String,
    pub poll: PollDraft,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePoll {
    pub room_id: String,
    pub option_idx: usize,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandSignal {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub room_id: String,
    pub emoji: String,
    #[serde(default)]
    pub user_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardData {
    pub room_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneUpdate {
    pub room_id: String,
    pub elements: Value,
    /// Monotonic per-room counter chosen by the client. Updates that carry a
    /// version at or below the last accepted one are stale.
    #[serde(default)]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTarget {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmuteRequest {
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
}

/// Chat messages carry arbitrary client fields next to `roomId`; they are
/// relayed as-is.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// A server -> client frame. Shared between recipients of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub event: &'static str,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: &'static str, data: Value) -> Arc<Self> {
        Arc::new(Self { event, data })
    }

    pub fn to_text(&self) -> String {
        // Serializing a &str and a Value cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
