use liveclass_models::gateway::{OutboundEvent, EVENT_PARTICIPANTS};
use liveclass_models::presence::Participant;

use crate::room::Room;
use crate::AppState;

/// Resolve avatars for everyone currently in the room (plus `extra`, for a
/// user about to join) so that projecting under the room lock never waits
/// on the lookup service. Members added after this snapshot warmed their own
/// avatar before joining.
pub async fn warm_avatars(state: &AppState, room_id: &str, extra: Option<&str>) {
    let mut user_ids: Vec<String> = match state.rooms.lock_existing(room_id).await {
        Some(room) => state
            .sessions
            .identities(room.members())
            .into_iter()
            .map(|(_, identity)| identity.user_id)
            .collect(),
        None => Vec::new(),
    };
    if let Some(user_id) = extra {
        user_ids.push(user_id.to_string());
    }
    if !user_ids.is_empty() {
        state.avatars.resolve(&user_ids).await;
    }
}

/// Participant list of a room in join order. Members that never declared an
/// identity are left out, as is `exclude`.
pub async fn project(state: &AppState, room: &Room, exclude: Option<&str>) -> Vec<Participant> {
    let members = state.sessions.identities(room.members());
    let mut participants = Vec::with_capacity(members.len());
    for (session_id, identity) in members {
        if exclude == Some(session_id.as_str()) {
            continue;
        }
        let avatar_ref = state.avatars.avatar(&identity.user_id).await;
        participants.push(Participant {
            hand_raised: room.hand_raised(&identity.user_id),
            is_muted: room.is_muted(&identity.user_id),
            is_instructor: identity.role.is_instructor(),
            session_id,
            user_id: identity.user_id,
            user_name: identity.user_name,
            avatar_ref,
        });
    }
    participants
}

pub fn participants_event(participants: &[Participant]) -> std::sync::Arc<OutboundEvent> {
    OutboundEvent::new(
        EVENT_PARTICIPANTS,
        serde_json::to_value(participants).unwrap_or_default(),
    )
}

/// Send the full projection to every member. Caller holds the room lock.
pub async fn broadcast_participants(state: &AppState, room: &Room) {
    let participants = project(state, room, None).await;
    tracing::debug!(
        room_id = room.room_id(),
        count = participants.len(),
        "broadcasting participants"
    );
    state
        .sessions
        .send_to_members(room.members(), None, participants_event(&participants));
}

/// Recompute and broadcast the projection of a room from scratch. Used by the
/// debounced reconciliation; a room that no longer exists or has emptied out
/// gets nothing.
pub async fn refresh_participants(state: &AppState, room_id: &str) {
    warm_avatars(state, room_id, None).await;
    let Some(room) = state.rooms.lock_existing(room_id).await else {
        return;
    };
    if room.members().is_empty() {
        return;
    }
    broadcast_participants(state, &room).await;
}
