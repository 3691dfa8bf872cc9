use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use liveclass_core::directory::{NoopUserLookup, UserLookup, UserRecord};
use liveclass_core::error::LookupError;
use liveclass_core::gateway::{connect, disconnect, handle_event};
use liveclass_core::session::OutboxReceiver;
use liveclass_core::{AppConfig, AppState};
use liveclass_models::gateway::{ClientEvent, OutboundEvent};
use serde_json::{json, Value};

struct Client {
    session_id: String,
    outbox: OutboxReceiver,
}

impl Client {
    fn connect(state: &AppState) -> Self {
        let (session_id, outbox) = connect(state);
        Self { session_id, outbox }
    }

    async fn send(&self, state: &AppState, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        let parsed = ClientEvent::parse(&frame).expect("valid frame");
        let _ = handle_event(state, &self.session_id, parsed).await;
    }

    async fn join(&self, state: &AppState, room: &str, user_id: &str, name: &str, instructor: bool) {
        self.send(
            state,
            "join-room",
            json!({"roomId": room, "userId": user_id, "userName": name, "isInstructor": instructor}),
        )
        .await;
    }

    fn drain(&mut self) -> Vec<Arc<OutboundEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbox.try_recv() {
            events.push(event);
        }
        events
    }
}

fn state() -> AppState {
    AppState::new(AppConfig::default(), Arc::new(NoopUserLookup))
}

/// Records every batch; fails until switched on.
#[derive(Default)]
struct RecordingLookup {
    calls: Mutex<Vec<Vec<String>>>,
    up: AtomicBool,
}

#[async_trait]
impl UserLookup for RecordingLookup {
    async fn lookup(&self, user_ids: &[String]) -> Result<Vec<UserRecord>, LookupError> {
        self.calls.lock().unwrap().push(user_ids.to_vec());
        if !self.up.load(Ordering::SeqCst) {
            return Err(LookupError::Remote("503".into()));
        }
        Ok(user_ids
            .iter()
            .map(|id| UserRecord {
                id: id.clone(),
                avatar_ref: Some(format!("a/{id}.png")),
            })
            .collect())
    }
}

fn names(events: &[Arc<OutboundEvent>]) -> Vec<&'static str> {
    events.iter().map(|e| e.event).collect()
}

fn user_ids(participants: &Value) -> Vec<String> {
    participants
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|p| p["userId"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn join_sequence_is_ordered() {
    let state = state();
    let mut a = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;

    let events = a.drain();
    assert_eq!(names(&events), ["participants", "participants"]);
    assert_eq!(events[0].data, json!([]));
    assert_eq!(user_ids(&events[1].data), ["u1"]);
    assert_eq!(events[1].data[0]["isInstructor"], json!(true));

    let mut b = Client::connect(&state);
    b.join(&state, "R1", "u2", "Bob", false).await;

    let to_b = b.drain();
    assert_eq!(names(&to_b), ["participants", "participants"]);
    assert_eq!(user_ids(&to_b[0].data), ["u1"]);
    assert_eq!(user_ids(&to_b[1].data), ["u1", "u2"]);

    let to_a = a.drain();
    assert_eq!(names(&to_a), ["user-joined", "participants"]);
    assert_eq!(to_a[0].data["userId"], json!("u2"));
    assert_eq!(to_a[0].data["sessionId"], json!(b.session_id));
    assert_eq!(user_ids(&to_a[1].data), ["u1", "u2"]);
}

#[tokio::test]
async fn voting_is_idempotent_per_user() {
    let state = state();
    let mut a = Client::connect(&state);
    let mut b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.drain();
    b.drain();

    a.send(&state, "launch-poll", json!({"roomId": "R1", "poll": {"question": "Pick", "options": ["x", "y"]}}))
        .await;
    b.send(&state, "vote-poll", json!({"roomId": "R1", "optionIdx": 1, "userId": "u2"}))
        .await;
    b.send(&state, "vote-poll", json!({"roomId": "R1", "optionIdx": 0, "userId": "u2"}))
        .await;

    let events = a.drain();
    assert_eq!(names(&events), ["poll-launched", "poll-updated"]);
    assert_eq!(events[1].data["votes"], json!([0, 1]));
    assert_eq!(events[1].data["voters"], json!(["u2"]));

    a.send(&state, "end-poll", json!({"roomId": "R1"})).await;
    b.send(&state, "vote-poll", json!({"roomId": "R1", "optionIdx": 0, "userId": "u3"}))
        .await;
    let events = b.drain();
    assert_eq!(names(&events).last(), Some(&"poll-ended"));
    assert_eq!(events.last().unwrap().data["votes"], json!([0, 1]));
}

#[tokio::test]
async fn hands_follow_raise_order() {
    let state = state();
    let mut a = Client::connect(&state);
    let b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.drain();

    a.send(&state, "raise-hand", json!({"roomId": "R1", "userId": "u1", "userName": "Alice"}))
        .await;
    b.send(&state, "raise-hand", json!({"roomId": "R1", "userId": "u2", "userName": "Bob"}))
        .await;
    b.send(&state, "raise-hand", json!({"roomId": "R1", "userId": "u2", "userName": "Bob"}))
        .await;
    a.send(&state, "lower-hand", json!({"roomId": "R1", "userId": "u1", "userName": "Alice"}))
        .await;

    let hands: Vec<Value> = a
        .drain()
        .iter()
        .filter(|e| e.event == "hands-updated")
        .map(|e| e.data.clone())
        .collect();
    assert_eq!(hands.first(), Some(&json!(["u1"])));
    assert_eq!(hands.last(), Some(&json!(["u2"])));
    assert!(hands.iter().all(|h| {
        let ids = h.as_array().unwrap();
        ids.iter().filter_map(Value::as_str).collect::<BTreeSet<_>>().len() == ids.len()
    }));
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_announced_then_settled() {
    let state = state();
    let mut a = Client::connect(&state);
    let b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.drain();

    disconnect(&state, &b.session_id).await;
    let immediate = a.drain();
    assert_eq!(names(&immediate), ["user-left"]);
    assert_eq!(immediate[0].data["userId"], json!("u2"));

    // Bob reconnects inside the grace window on a new connection.
    let b2 = Client::connect(&state);
    tokio::time::sleep(Duration::from_millis(500)).await;
    b2.join(&state, "R1", "u2", "Bob", false).await;
    a.drain();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let settled = a.drain();
    assert_eq!(names(&settled), ["participants"]);
    assert_eq!(user_ids(&settled[0].data), ["u1", "u2"]);
    assert_eq!(settled[0].data[1]["sessionId"], json!(b2.session_id));
}

#[tokio::test(start_paused = true)]
async fn simultaneous_drops_produce_one_projection() {
    let state = state();
    let mut a = Client::connect(&state);
    let b = Client::connect(&state);
    let c = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    c.join(&state, "R1", "u3", "Cara", false).await;
    a.drain();

    disconnect(&state, &b.session_id).await;
    disconnect(&state, &c.session_id).await;
    assert_eq!(names(&a.drain()), ["user-left", "user-left"]);

    tokio::time::sleep(Duration::from_millis(1600)).await;
    let settled = a.drain();
    assert_eq!(names(&settled), ["participants"]);
    assert_eq!(user_ids(&settled[0].data), ["u1"]);
    assert_eq!(state.sessions.session_count(), 1);
}

#[tokio::test]
async fn relayed_signals_never_echo() {
    let state = state();
    let mut a = Client::connect(&state);
    let mut b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.drain();
    b.drain();

    for event in ["offer", "answer", "ice-candidate"] {
        a.send(&state, event, json!({"roomId": "R1", "payload": {"n": 1}, "userId": "u1"}))
            .await;
    }
    assert!(a.drain().is_empty());
    let got = b.drain();
    assert_eq!(names(&got), ["offer", "answer", "ice-candidate"]);
    assert!(got.iter().all(|e| e.data["sessionId"] == json!(a.session_id)));
}

#[tokio::test]
async fn joiner_gets_scene_before_later_deltas() {
    let state = state();
    let mut a = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    a.send(&state, "whiteboard-scene-update", json!({"roomId": "R1", "elements": [{"id": "e1"}]}))
        .await;
    a.drain();

    let mut b = Client::connect(&state);
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.send(&state, "whiteboard-scene-update", json!({"roomId": "R1", "elements": [{"id": "e2"}]}))
        .await;

    let events = b.drain();
    let scenes: Vec<&Value> = events
        .iter()
        .filter(|e| e.event == "whiteboard-scene-update")
        .map(|e| &e.data["elements"])
        .collect();
    assert_eq!(scenes, [&json!([{"id": "e1"}]), &json!([{"id": "e2"}])]);
    assert_eq!(events[0].event, "participants");
    assert_eq!(events[1].event, "whiteboard-scene-update");
}

#[tokio::test]
async fn joiner_is_synced_with_existing_room_state() {
    let state = state();
    let a = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    a.send(&state, "launch-poll", json!({"roomId": "R1", "poll": {"question": "Q", "options": ["x"]}}))
        .await;
    a.send(&state, "raise-hand", json!({"roomId": "R1", "userId": "u1", "userName": "Alice"}))
        .await;
    a.send(&state, "whiteboard-update", json!({"roomId": "R1", "data": [{"line": 1}]}))
        .await;
    a.send(&state, "mute-user", json!({"roomId": "R1", "userId": "u2"})).await;

    let mut b = Client::connect(&state);
    b.join(&state, "R1", "u2", "Bob", false).await;
    let events = b.drain();
    assert_eq!(
        names(&events),
        [
            "participants",
            "whiteboard-update",
            "poll-launched",
            "hands-updated",
            "muted-users",
            "participants"
        ]
    );
    assert_eq!(events[5].data[1]["isMuted"], json!(true));
}

#[tokio::test]
async fn membership_matches_session_rooms() {
    let state = state();
    let a = Client::connect(&state);
    let b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    a.join(&state, "R2", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.join(&state, "R1", "u1", "Alice", true).await;
    a.send(&state, "leave-room", json!({"roomId": "R1"})).await;
    b.send(&state, "leave-room", json!({"roomId": "R9"})).await;

    for room_id in ["R1", "R2"] {
        let room = state.rooms.lock(room_id).await;
        let members: BTreeSet<String> = room.members().iter().cloned().collect();
        let expected: BTreeSet<String> = [&a, &b]
            .iter()
            .filter(|c| state.sessions.rooms(&c.session_id).iter().any(|r| r == room_id))
            .map(|c| c.session_id.clone())
            .collect();
        assert_eq!(members, expected, "room {room_id}");
    }
    assert_eq!(state.sessions.rooms(&a.session_id), ["R2"]);
    assert!(!state.rooms.contains("R9"));
}

#[tokio::test]
async fn events_from_removed_sessions_are_ignored() {
    let state = state();
    let a = Client::connect(&state);
    disconnect(&state, &a.session_id).await;
    let frame = json!({"event": "join-room", "data": {"roomId": "R1", "userId": "u1", "userName": "A"}});
    let parsed = ClientEvent::parse(&frame.to_string()).unwrap();
    assert!(handle_event(&state, &a.session_id, parsed).await.is_err());
    assert!(!state.rooms.contains("R1"));
}

#[tokio::test]
async fn mute_all_drops_users_who_left() {
    let state = state();
    let mut a = Client::connect(&state);
    let b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    a.send(&state, "mute-user", json!({"roomId": "R1", "userId": "u2"})).await;
    b.send(&state, "leave-room", json!({"roomId": "R1"})).await;
    a.drain();

    a.send(&state, "mute-all", json!({"roomId": "R1"})).await;
    let muted: Vec<Value> = a
        .drain()
        .iter()
        .filter(|e| e.event == "muted-users")
        .map(|e| e.data.clone())
        .collect();
    assert_eq!(muted, [json!([])]);
}

#[tokio::test]
async fn join_resolves_missing_avatars_in_one_batch() {
    let lookup = Arc::new(RecordingLookup::default());
    let state = AppState::new(AppConfig::default(), lookup.clone());
    let a = Client::connect(&state);
    let b = Client::connect(&state);
    a.join(&state, "R1", "u1", "Alice", true).await;
    b.join(&state, "R1", "u2", "Bob", false).await;
    assert!(!state.avatars.is_resolved("u1"));
    assert!(!state.avatars.is_resolved("u2"));

    lookup.up.store(true, Ordering::SeqCst);
    lookup.calls.lock().unwrap().clear();
    let mut c = Client::connect(&state);
    c.join(&state, "R1", "u3", "Cara", false).await;

    assert_eq!(
        *lookup.calls.lock().unwrap(),
        [vec!["u1".to_string(), "u2".to_string(), "u3".to_string()]]
    );
    let events = c.drain();
    let last = &events.last().unwrap().data;
    assert_eq!(user_ids(last), ["u1", "u2", "u3"]);
    assert_eq!(last[2]["avatarRef"], json!("a/u3.png"));
}
