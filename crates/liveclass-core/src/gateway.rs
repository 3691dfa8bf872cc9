//! Session lifecycle and inbound event dispatch.
//!
//! The transport layer calls [`connect`] once per connection, feeds every
//! parsed frame to [`handle_event`] and calls [`disconnect`] when the socket
//! goes away.

use liveclass_models::gateway::{
    ClientEvent, JoinRoom, OutboundEvent, EVENT_ANSWER, EVENT_HANDS_UPDATED,
    EVENT_ICE_CANDIDATE, EVENT_MUTED_USERS, EVENT_OFFER, EVENT_POLL_LAUNCHED, EVENT_USER_JOINED,
    EVENT_USER_LEFT, EVENT_WHITEBOARD_SCENE_UPDATE, EVENT_WHITEBOARD_UPDATE,
};
use liveclass_models::presence::{Identity, PeerInfo, Role};
use serde_json::json;

use crate::error::CoreError;
use crate::presence::{broadcast_participants, participants_event, project, warm_avatars};
use crate::session::OutboxReceiver;
use crate::{broadcast, signaling, AppState};

/// Register a new connection.
pub fn connect(state: &AppState) -> (String, OutboxReceiver) {
    let (session_id, outbox) = state.sessions.register();
    tracing::info!(session_id = %session_id, "session connected");
    (session_id, outbox)
}

/// Route one validated client event.
pub async fn handle_event(
    state: &AppState,
    session_id: &str,
    event: ClientEvent,
) -> Result<(), CoreError> {
    if !state.sessions.contains(session_id) {
        return Err(CoreError::UnknownSession(session_id.to_string()));
    }
    match event {
        ClientEvent::JoinRoom(join) => join_room(state, session_id, join).await,
        ClientEvent::LeaveRoom(leave) => {
            leave_room(state, session_id, &leave.room_id).await;
            Ok(())
        }
        ClientEvent::Offer(signal) => signaling::relay(state, session_id, EVENT_OFFER, signal).await,
        ClientEvent::Answer(signal) => {
            signaling::relay(state, session_id, EVENT_ANSWER, signal).await
        }
        ClientEvent::IceCandidate(signal) => {
            signaling::relay(state, session_id, EVENT_ICE_CANDIDATE, signal).await
        }
        ClientEvent::LaunchPoll(launch) => broadcast::launch_poll(state, launch).await,
        ClientEvent::VotePoll(vote) => broadcast::vote_poll(state, vote).await,
        ClientEvent::EndPoll(end) => broadcast::end_poll(state, &end.room_id).await,
        ClientEvent::RaiseHand(hand) => broadcast::raise_hand(state, hand).await,
        ClientEvent::LowerHand(hand) => broadcast::lower_hand(state, hand).await,
        ClientEvent::SendReaction(reaction) => broadcast::send_reaction(state, reaction).await,
        ClientEvent::WhiteboardUpdate(update) => {
            broadcast::whiteboard_update(state, session_id, update).await
        }
        ClientEvent::WhiteboardClear(clear) => {
            broadcast::whiteboard_clear(state, &clear.room_id).await
        }
        ClientEvent::WhiteboardOpened(opened) => {
            broadcast::whiteboard_opened(state, &opened.room_id).await
        }
        ClientEvent::WhiteboardSceneUpdate(update) => {
            broadcast::scene_update(state, session_id, update).await
        }
        ClientEvent::MuteAll(target) => broadcast::mute_all(state, &target.room_id).await,
        ClientEvent::UnmuteAll(target) => broadcast::unmute_all(state, &target.room_id).await,
        ClientEvent::MuteUser(target) => broadcast::mute_user(state, target).await,
        ClientEvent::UnmuteUser(target) => broadcast::unmute_user(state, target).await,
        ClientEvent::RequestUnmute(request) => broadcast::request_unmute(state, request).await,
        ClientEvent::ChatMessage(chat) => broadcast::chat_message(state, session_id, chat).await,
    }
}

/// Attach the identity, add the session to the room and bring everybody up
/// to date. Everything after the avatar warm-up happens under the room lock,
/// so no other event of the room can interleave with the sequence.
async fn join_room(state: &AppState, session_id: &str, join: JoinRoom) -> Result<(), CoreError> {
    let identity = Identity {
        user_id: join.user_id,
        user_name: join.user_name,
        role: Role::from_instructor_flag(join.is_instructor),
    };
    if !state.sessions.set_identity(session_id, identity.clone()) {
        return Err(CoreError::UnknownSession(session_id.to_string()));
    }

    warm_avatars(state, &join.room_id, Some(&identity.user_id)).await;

    let mut room = state.rooms.lock(&join.room_id).await;
    // Registering the room on the session fails once the session has been
    // torn down; in that case the membership must not be recorded either.
    if !state.sessions.add_room(session_id, &join.room_id) {
        return Ok(());
    }
    let newly_joined = room.add_member(session_id);
    tracing::info!(
        room_id = %join.room_id,
        session_id,
        user_id = %identity.user_id,
        role = ?identity.role,
        rejoin = !newly_joined,
        "joined room"
    );

    let others = project(state, &room, Some(session_id)).await;
    state.sessions.send(session_id, participants_event(&others));

    if let Some(scene) = room.scene() {
        let mut data = json!({ "elements": scene.elements });
        if let Some(version) = scene.version {
            data["version"] = json!(version);
        }
        state.sessions.send(
            session_id,
            OutboundEvent::new(EVENT_WHITEBOARD_SCENE_UPDATE, data),
        );
    }
    if let Some(data) = room.legacy_whiteboard() {
        state.sessions.send(
            session_id,
            OutboundEvent::new(EVENT_WHITEBOARD_UPDATE, data.clone()),
        );
    }
    if let Some(poll) = room.active_poll() {
        state
            .sessions
            .send(session_id, OutboundEvent::new(EVENT_POLL_LAUNCHED, json!(poll)));
    }
    if !room.raised_hands().is_empty() {
        state.sessions.send(
            session_id,
            OutboundEvent::new(EVENT_HANDS_UPDATED, json!(room.raised_hand_ids())),
        );
    }
    if !room.muted_users().is_empty() {
        state.sessions.send(
            session_id,
            OutboundEvent::new(EVENT_MUTED_USERS, json!(room.muted_users())),
        );
    }

    state.sessions.send_to_members(
        room.members(),
        Some(session_id),
        OutboundEvent::new(EVENT_USER_JOINED, json!(PeerInfo::new(session_id, &identity))),
    );

    broadcast_participants(state, &room).await;
    Ok(())
}

/// Leave one room explicitly. Reconciled like a disconnect for that room.
async fn leave_room(state: &AppState, session_id: &str, room_id: &str) {
    let identity = state.sessions.identity(session_id);
    let left = {
        let Some(mut room) = state.rooms.lock_existing(room_id).await else {
            return;
        };
        let left = depart(state, &mut room, session_id, identity.as_ref());
        state.sessions.remove_room(session_id, room_id);
        left
    };
    if left {
        schedule_refresh(state, room_id);
    }
}

/// Tear down a connection: unregister it first so a join still in flight
/// cannot re-add it, then reconcile every room it was in.
pub async fn disconnect(state: &AppState, session_id: &str) {
    let Some(session) = state.sessions.remove(session_id) else {
        return;
    };
    tracing::info!(
        session_id,
        rooms = session.rooms.len(),
        "session disconnected"
    );
    for room_id in &session.rooms {
        let left = match state.rooms.lock_existing(room_id).await {
            Some(mut room) => depart(state, &mut room, session_id, session.identity.as_ref()),
            None => false,
        };
        if left {
            schedule_refresh(state, room_id);
        }
    }
}

/// Remove the membership and tell the remaining members right away.
fn depart(
    state: &AppState,
    room: &mut crate::room::Room,
    session_id: &str,
    identity: Option<&Identity>,
) -> bool {
    if !room.remove_member(session_id) {
        return false;
    }
    if let Some(identity) = identity {
        state.sessions.send_to_members(
            room.members(),
            None,
            OutboundEvent::new(EVENT_USER_LEFT, json!(PeerInfo::new(session_id, identity))),
        );
    }
    tracing::info!(room_id = room.room_id(), session_id, "left room");
    true
}

/// Debounced presence re-broadcast for a room.
fn schedule_refresh(state: &AppState, room_id: &str) {
    let task_state = state.clone();
    let task_room = room_id.to_string();
    state.presence_manager.schedule(room_id, async move {
        crate::presence::refresh_participants(&task_state, &task_room).await;
    });
}
