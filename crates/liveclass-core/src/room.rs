use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use liveclass_models::poll::{Poll, PollDraft};
use liveclass_models::presence::RaisedHand;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Duration, Instant};

use crate::error::RoomError;

/// Last accepted whiteboard scene of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub elements: Value,
    pub version: Option<u64>,
}

/// Ephemeral state of one live class room.
///
/// Fields are private: every mutation goes through the methods below, which
/// are only reachable through a guard handed out by [`RoomStore::lock`].
#[derive(Debug)]
pub struct Room {
    room_id: String,
    members: Vec<String>,
    active_poll: Option<Poll>,
    raised_hands: Vec<RaisedHand>,
    muted_users: BTreeSet<String>,
    scene: Option<Scene>,
    legacy_whiteboard: Option<Value>,
    emptied_at: Option<Instant>,
    evicted: bool,
}

impl Room {
    fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            members: Vec::new(),
            active_poll: None,
            raised_hands: Vec::new(),
            muted_users: BTreeSet::new(),
            scene: None,
            legacy_whiteboard: None,
            emptied_at: Some(Instant::now()),
            evicted: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    // ── Membership ───────────────────────────────────────────────────────────

    /// Session ids in join order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_member(&self, session_id: &str) -> bool {
        self.members.iter().any(|m| m == session_id)
    }

    /// Returns false when the session was already a member.
    pub fn add_member(&mut self, session_id: &str) -> bool {
        if self.is_member(session_id) {
            return false;
        }
        self.members.push(session_id.to_string());
        self.emptied_at = None;
        true
    }

    /// Returns false when the session was not a member.
    pub fn remove_member(&mut self, session_id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != session_id);
        let removed = self.members.len() != before;
        if removed && self.members.is_empty() {
            self.emptied_at = Some(Instant::now());
        }
        removed
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.members.is_empty()
            && self
                .emptied_at
                .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
    }

    // ── Polls ────────────────────────────────────────────────────────────────

    pub fn active_poll(&self) -> Option<&Poll> {
        self.active_poll.as_ref()
    }

    /// Replaces any running poll.
    pub fn launch_poll(&mut self, draft: PollDraft) -> &Poll {
        self.active_poll.insert(Poll::launch(draft))
    }

    /// Records a vote. `Ok(None)` means the vote was absorbed: there is no
    /// active poll or the user already voted.
    pub fn vote(&mut self, option_idx: usize, user_id: &str) -> Result<Option<&Poll>, RoomError> {
        let Some(poll) = self.active_poll.as_mut() else {
            return Ok(None);
        };
        if poll.has_voted(user_id) {
            return Ok(None);
        }
        let options = poll.votes.len();
        let Some(count) = poll.votes.get_mut(option_idx) else {
            return Err(RoomError::OptionOutOfRange {
                index: option_idx,
                options,
            });
        };
        *count += 1;
        poll.voters.push(user_id.to_string());
        Ok(Some(&*poll))
    }

    /// Clears the poll and returns its final tally.
    pub fn end_poll(&mut self) -> Option<Poll> {
        self.active_poll.take()
    }

    // ── Hands ────────────────────────────────────────────────────────────────

    pub fn raised_hands(&self) -> &[RaisedHand] {
        &self.raised_hands
    }

    pub fn hand_raised(&self, user_id: &str) -> bool {
        self.raised_hands.iter().any(|h| h.user_id == user_id)
    }

    pub fn raise_hand(&mut self, user_id: &str, user_name: &str) -> bool {
        if self.hand_raised(user_id) {
            return false;
        }
        self.raised_hands.push(RaisedHand {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
        });
        true
    }

    pub fn lower_hand(&mut self, user_id: &str) -> bool {
        let before = self.raised_hands.len();
        self.raised_hands.retain(|h| h.user_id != user_id);
        self.raised_hands.len() != before
    }

    pub fn raised_hand_ids(&self) -> Vec<String> {
        self.raised_hands.iter().map(|h| h.user_id.clone()).collect()
    }

    // ── Mute ─────────────────────────────────────────────────────────────────

    pub fn muted_users(&self) -> &BTreeSet<String> {
        &self.muted_users
    }

    pub fn is_muted(&self, user_id: &str) -> bool {
        self.muted_users.contains(user_id)
    }

    pub fn set_muted(&mut self, user_id: &str) -> bool {
        self.muted_users.insert(user_id.to_string())
    }

    pub fn unmute_one(&mut self, user_id: &str) -> bool {
        self.muted_users.remove(user_id)
    }

    pub fn unmute_all(&mut self) {
        self.muted_users.clear();
    }

    /// Replaces the mute list with the given snapshot of current members.
    /// Earlier entries for users who have since left are dropped.
    pub fn mute_all<I>(&mut self, user_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.muted_users = user_ids.into_iter().collect();
    }

    // ── Whiteboard ───────────────────────────────────────────────────────────

    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    /// Last-writer-wins replace. A versioned update is rejected when it is
    /// not newer than the last accepted version; unversioned updates always
    /// apply.
    pub fn update_scene(&mut self, elements: Value, version: Option<u64>) -> bool {
        if let (Some(incoming), Some(Scene {
            version: Some(current),
            ..
        })) = (version, self.scene.as_ref())
        {
            if incoming <= *current {
                return false;
            }
        }
        let version = version.or_else(|| self.scene.as_ref().and_then(|s| s.version));
        self.scene = Some(Scene { elements, version });
        true
    }

    /// Last legacy drawing payload, exactly as the client sent it.
    pub fn legacy_whiteboard(&self) -> Option<&Value> {
        self.legacy_whiteboard.as_ref()
    }

    pub fn update_whiteboard(&mut self, data: Value) {
        self.legacy_whiteboard = Some(data);
    }

    pub fn clear_whiteboard(&mut self) {
        self.legacy_whiteboard = None;
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }
}

/// Room table with one exclusive lock per room.
///
/// Events for the same room are serialized by the room's lock; different
/// rooms never contend. Callers must not hold two room guards at once.
pub struct RoomStore {
    rooms: DashMap<String, Arc<Mutex<Room>>>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Lock a room, creating an empty one on first access.
    pub async fn lock(&self, room_id: &str) -> OwnedMutexGuard<Room> {
        loop {
            let existing = self.rooms.get(room_id).map(|r| Arc::clone(r.value()));
            let room = match existing {
                Some(room) => room,
                None => Arc::clone(
                    self.rooms
                        .entry(room_id.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id))))
                        .value(),
                ),
            };
            let guard = room.lock_owned().await;
            // The sweeper evicted this record while we were waiting; the map
            // no longer holds it, so the next pass creates a fresh one.
            if !guard.is_evicted() {
                return guard;
            }
        }
    }

    /// Lock a room only if it exists.
    pub async fn lock_existing(&self, room_id: &str) -> Option<OwnedMutexGuard<Room>> {
        let room = self.rooms.get(room_id).map(|r| Arc::clone(r.value()))?;
        let guard = room.lock_owned().await;
        (!guard.is_evicted()).then_some(guard)
    }

    /// Removes rooms that have been empty for at least `ttl`. Rooms that are
    /// currently locked are skipped until the next sweep.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let candidates: Vec<(String, Arc<Mutex<Room>>)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = Vec::new();
        for (room_id, room) in candidates {
            let Ok(mut guard) = room.try_lock() else {
                continue;
            };
            if !guard.is_idle(now, ttl) {
                continue;
            }
            guard.evicted = true;
            self.rooms
                .remove_if(&room_id, |_, current| Arc::ptr_eq(current, &room));
            drop(guard);
            evicted.push(room_id);
        }
        evicted
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}
