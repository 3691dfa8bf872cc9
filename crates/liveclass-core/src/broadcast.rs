//! Room-scoped state changes and their fan-out.
//!
//! Each handler applies its mutation and enqueues the resulting events while
//! holding the room lock. State every client must mirror (polls, hands, mute
//! list) goes to the whole room; transient cues from one client (drawing
//! deltas, chat) skip the sender.

use std::sync::Arc;

use liveclass_models::gateway::{
    ChatMessage, HandSignal, LaunchPoll, OutboundEvent, Reaction, SceneUpdate, UnmuteRequest,
    UserTarget, VotePoll, WhiteboardData, EVENT_CHAT_MESSAGE, EVENT_HANDS_UPDATED,
    EVENT_MUTED_USERS, EVENT_POLL_ENDED, EVENT_POLL_LAUNCHED, EVENT_POLL_UPDATED,
    EVENT_SHOW_REACTION, EVENT_UNMUTE_REQUESTED, EVENT_WHITEBOARD_CLEAR, EVENT_WHITEBOARD_OPENED,
    EVENT_WHITEBOARD_SCENE_UPDATE, EVENT_WHITEBOARD_UPDATE,
};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::presence::{broadcast_participants, warm_avatars};
use crate::room::Room;
use crate::AppState;

fn to_room(state: &AppState, room: &Room, event: Arc<OutboundEvent>) {
    state.sessions.send_to_members(room.members(), None, event);
}

fn to_others(state: &AppState, room: &Room, sender: &str, event: Arc<OutboundEvent>) {
    state
        .sessions
        .send_to_members(room.members(), Some(sender), event);
}

// ── Polls ────────────────────────────────────────────────────────────────────

pub async fn launch_poll(state: &AppState, launch: LaunchPoll) -> Result<(), CoreError> {
    let mut room = state.rooms.lock(&launch.room_id).await;
    let data = json!(room.launch_poll(launch.poll));
    tracing::info!(room_id = %launch.room_id, "poll launched");
    to_room(state, &room, OutboundEvent::new(EVENT_POLL_LAUNCHED, data));
    Ok(())
}

pub async fn vote_poll(state: &AppState, vote: VotePoll) -> Result<(), CoreError> {
    let mut room = state.rooms.lock(&vote.room_id).await;
    let data = match room.vote(vote.option_idx, &vote.user_id)? {
        Some(poll) => json!(poll),
        None => {
            tracing::debug!(
                room_id = %vote.room_id,
                user_id = %vote.user_id,
                "vote absorbed"
            );
            return Ok(());
        }
    };
    to_room(state, &room, OutboundEvent::new(EVENT_POLL_UPDATED, data));
    Ok(())
}

pub async fn end_poll(state: &AppState, room_id: &str) -> Result<(), CoreError> {
    let mut room = state.rooms.lock(room_id).await;
    let Some(tally) = room.end_poll() else {
        return Ok(());
    };
    tracing::info!(room_id, votes = tally.voters.len(), "poll ended");
    to_room(state, &room, OutboundEvent::new(EVENT_POLL_ENDED, json!(tally)));
    Ok(())
}

// ── Hands ────────────────────────────────────────────────────────────────────

pub async fn raise_hand(state: &AppState, hand: HandSignal) -> Result<(), CoreError> {
    warm_avatars(state, &hand.room_id, None).await;
    let mut room = state.rooms.lock(&hand.room_id).await;
    room.raise_hand(&hand.user_id, &hand.user_name);
    hands_changed(state, &room).await;
    Ok(())
}

pub async fn lower_hand(state: &AppState, hand: HandSignal) -> Result<(), CoreError> {
    warm_avatars(state, &hand.room_id, None).await;
    let mut room = state.rooms.lock(&hand.room_id).await;
    room.lower_hand(&hand.user_id);
    hands_changed(state, &room).await;
    Ok(())
}

async fn hands_changed(state: &AppState, room: &Room) {
    to_room(
        state,
        room,
        OutboundEvent::new(EVENT_HANDS_UPDATED, json!(room.raised_hand_ids())),
    );
    broadcast_participants(state, room).await;
}

pub async fn send_reaction(state: &AppState, reaction: Reaction) -> Result<(), CoreError> {
    let room = state.rooms.lock(&reaction.room_id).await;
    to_room(
        state,
        &room,
        OutboundEvent::new(
            EVENT_SHOW_REACTION,
            json!({ "emoji": reaction.emoji, "userName": reaction.user_name }),
        ),
    );
    Ok(())
}

// ── Whiteboard ───────────────────────────────────────────────────────────────

pub async fn whiteboard_update(
    state: &AppState,
    sender: &str,
    update: WhiteboardData,
) -> Result<(), CoreError> {
    let mut room = state.rooms.lock(&update.room_id).await;
    let event = OutboundEvent::new(EVENT_WHITEBOARD_UPDATE, update.data.clone());
    room.update_whiteboard(update.data);
    to_others(state, &room, sender, event);
    Ok(())
}

pub async fn whiteboard_clear(state: &AppState, room_id: &str) -> Result<(), CoreError> {
    let mut room = state.rooms.lock(room_id).await;
    room.clear_whiteboard();
    to_room(
        state,
        &room,
        OutboundEvent::new(EVENT_WHITEBOARD_CLEAR, json!({ "roomId": room_id })),
    );
    Ok(())
}

pub async fn whiteboard_opened(state: &AppState, room_id: &str) -> Result<(), CoreError> {
    let room = state.rooms.lock(room_id).await;
    to_room(
        state,
        &room,
        OutboundEvent::new(EVENT_WHITEBOARD_OPENED, json!({ "roomId": room_id })),
    );
    Ok(())
}

pub async fn scene_update(
    state: &AppState,
    sender: &str,
    update: SceneUpdate,
) -> Result<(), CoreError> {
    let mut room = state.rooms.lock(&update.room_id).await;
    let mut data = json!({ "elements": update.elements });
    if let Some(version) = update.version {
        data["version"] = json!(version);
    }
    if !room.update_scene(update.elements, update.version) {
        tracing::debug!(
            room_id = %update.room_id,
            version = ?update.version,
            "stale scene update dropped"
        );
        return Ok(());
    }
    to_others(
        state,
        &room,
        sender,
        OutboundEvent::new(EVENT_WHITEBOARD_SCENE_UPDATE, data),
    );
    Ok(())
}

// ── Mute ─────────────────────────────────────────────────────────────────────

/// Mutes every member that is not an instructor, as of now. Later joiners
/// are not affected.
pub async fn mute_all(state: &AppState, room_id: &str) -> Result<(), CoreError> {
    warm_avatars(state, room_id, None).await;
    let mut room = state.rooms.lock(room_id).await;
    let participants: Vec<String> = state
        .sessions
        .identities(room.members())
        .into_iter()
        .filter(|(_, identity)| !identity.role.is_instructor())
        .map(|(_, identity)| identity.user_id)
        .collect();
    room.mute_all(participants);
    mute_changed(state, &room).await;
    Ok(())
}

pub async fn unmute_all(state: &AppState, room_id: &str) -> Result<(), CoreError> {
    warm_avatars(state, room_id, None).await;
    let mut room = state.rooms.lock(room_id).await;
    room.unmute_all();
    mute_changed(state, &room).await;
    Ok(())
}

pub async fn mute_user(state: &AppState, target: UserTarget) -> Result<(), CoreError> {
    warm_avatars(state, &target.room_id, None).await;
    let mut room = state.rooms.lock(&target.room_id).await;
    room.set_muted(&target.user_id);
    mute_changed(state, &room).await;
    Ok(())
}

pub async fn unmute_user(state: &AppState, target: UserTarget) -> Result<(), CoreError> {
    warm_avatars(state, &target.room_id, None).await;
    let mut room = state.rooms.lock(&target.room_id).await;
    room.unmute_one(&target.user_id);
    mute_changed(state, &room).await;
    Ok(())
}

async fn mute_changed(state: &AppState, room: &Room) {
    to_room(
        state,
        room,
        OutboundEvent::new(EVENT_MUTED_USERS, json!(room.muted_users())),
    );
    broadcast_participants(state, room).await;
}

pub async fn request_unmute(state: &AppState, request: UnmuteRequest) -> Result<(), CoreError> {
    let room = state.rooms.lock(&request.room_id).await;
    to_room(
        state,
        &room,
        OutboundEvent::new(
            EVENT_UNMUTE_REQUESTED,
            json!({ "userId": request.user_id, "userName": request.user_name }),
        ),
    );
    Ok(())
}

// ── Chat ─────────────────────────────────────────────────────────────────────

pub async fn chat_message(
    state: &AppState,
    sender: &str,
    chat: ChatMessage,
) -> Result<(), CoreError> {
    let room = state.rooms.lock(&chat.room_id).await;
    let mut fields = chat.fields;
    fields.insert("roomId".to_string(), Value::String(chat.room_id.clone()));
    to_others(
        state,
        &room,
        sender,
        OutboundEvent::new(EVENT_CHAT_MESSAGE, Value::Object(fields)),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::NoopUserLookup;
    use crate::session::OutboxReceiver;
    use crate::AppConfig;
    use liveclass_models::gateway::EVENT_PARTICIPANTS;
    use liveclass_models::presence::{Identity, Role};

    fn drain(rx: &mut OutboxReceiver) -> Vec<Arc<OutboundEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn room_with(state: &AppState, people: &[(&str, Role)]) -> Vec<(String, OutboxReceiver)> {
        let mut sessions = Vec::new();
        for (user_id, role) in people {
            let (sid, rx) = state.sessions.register();
            state.sessions.set_identity(
                &sid,
                Identity {
                    user_id: user_id.to_string(),
                    user_name: user_id.to_uppercase(),
                    role: *role,
                },
            );
            state.sessions.add_room(&sid, "R1");
            state.rooms.lock("R1").await.add_member(&sid);
            sessions.push((sid, rx));
        }
        sessions
    }

    fn state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(NoopUserLookup))
    }

    #[tokio::test]
    async fn mute_all_skips_instructors() {
        let state = state();
        let mut people = room_with(
            &state,
            &[("u1", Role::Instructor), ("u2", Role::Participant), ("u3", Role::Participant)],
        )
        .await;
        mute_all(&state, "R1").await.unwrap();

        let events = drain(&mut people[0].1);
        assert_eq!(events[0].event, EVENT_MUTED_USERS);
        assert_eq!(events[0].data, json!(["u2", "u3"]));
        assert_eq!(events[1].event, EVENT_PARTICIPANTS);
        assert_eq!(events[1].data[1]["isMuted"], json!(true));
        assert_eq!(events[1].data[0]["isMuted"], json!(false));
    }

    #[tokio::test]
    async fn invalid_vote_is_reported_and_not_broadcast() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor)]).await;
        launch_poll(
            &state,
            LaunchPoll {
                room_id: "R1".into(),
                poll: liveclass_models::poll::PollDraft {
                    question: "Q".into(),
                    options: vec!["x".into(), "y".into()],
                },
            },
        )
        .await
        .unwrap();
        drain(&mut people[0].1);

        let err = vote_poll(
            &state,
            VotePoll {
                room_id: "R1".into(),
                option_idx: 5,
                user_id: "u1".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Room(_)));
        assert!(drain(&mut people[0].1).is_empty());
    }

    #[tokio::test]
    async fn end_poll_without_poll_is_silent() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor)]).await;
        end_poll(&state, "R1").await.unwrap();
        assert!(drain(&mut people[0].1).is_empty());
    }

    #[tokio::test]
    async fn stale_scene_is_not_fanned_out() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor), ("u2", Role::Participant)]).await;
        let sender = people[0].0.clone();
        let update = |elements: Value, version| SceneUpdate {
            room_id: "R1".into(),
            elements,
            version,
        };
        scene_update(&state, &sender, update(json!(["a"]), Some(3))).await.unwrap();
        scene_update(&state, &sender, update(json!(["old"]), Some(2))).await.unwrap();

        let seen = drain(&mut people[1].1);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, json!({"elements": ["a"], "version": 3}));
        assert!(drain(&mut people[0].1).is_empty());
    }

    #[tokio::test]
    async fn chat_is_relayed_with_room_id_except_sender() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor), ("u2", Role::Participant)]).await;
        let sender = people[1].0.clone();
        let mut fields = serde_json::Map::new();
        fields.insert("text".into(), json!("hello"));
        chat_message(
            &state,
            &sender,
            ChatMessage {
                room_id: "R1".into(),
                fields,
            },
        )
        .await
        .unwrap();

        assert!(drain(&mut people[1].1).is_empty());
        let got = drain(&mut people[0].1);
        assert_eq!(got[0].event, EVENT_CHAT_MESSAGE);
        assert_eq!(got[0].data, json!({"text": "hello", "roomId": "R1"}));
    }

    #[tokio::test]
    async fn whiteboard_clear_reaches_sender_too() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor), ("u2", Role::Participant)]).await;
        let sender = people[0].0.clone();
        whiteboard_update(
            &state,
            &sender,
            WhiteboardData {
                room_id: "R1".into(),
                data: json!([{"x": 1}]),
            },
        )
        .await
        .unwrap();
        assert!(drain(&mut people[0].1).is_empty());
        assert_eq!(drain(&mut people[1].1)[0].data, json!([{"x": 1}]));

        whiteboard_clear(&state, "R1").await.unwrap();
        assert_eq!(drain(&mut people[0].1)[0].event, EVENT_WHITEBOARD_CLEAR);
        assert_eq!(drain(&mut people[1].1)[0].event, EVENT_WHITEBOARD_CLEAR);
        assert!(state.rooms.lock("R1").await.legacy_whiteboard().is_none());
    }

    #[tokio::test]
    async fn whiteboard_payload_is_relayed_as_sent() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor), ("u2", Role::Participant)]).await;
        let sender = people[0].0.clone();
        for data in [json!({"strokes": [1, 2]}), Value::Null] {
            whiteboard_update(
                &state,
                &sender,
                WhiteboardData {
                    room_id: "R1".into(),
                    data,
                },
            )
            .await
            .unwrap();
        }

        let seen: Vec<Value> = drain(&mut people[1].1)
            .iter()
            .map(|e| e.data.clone())
            .collect();
        assert_eq!(seen, vec![json!({"strokes": [1, 2]}), Value::Null]);
    }

    #[tokio::test]
    async fn mute_all_forgets_departed_users() {
        let state = state();
        let mut people = room_with(&state, &[("u1", Role::Instructor), ("u2", Role::Participant)]).await;
        mute_user(
            &state,
            UserTarget {
                room_id: "R1".into(),
                user_id: "u2".into(),
            },
        )
        .await
        .unwrap();
        let departed = people[1].0.clone();
        state.rooms.lock("R1").await.remove_member(&departed);
        drain(&mut people[0].1);

        mute_all(&state, "R1").await.unwrap();
        let events = drain(&mut people[0].1);
        assert_eq!(events[0].event, EVENT_MUTED_USERS);
        assert_eq!(events[0].data, json!([]));
    }
}
