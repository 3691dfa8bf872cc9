use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use liveclass_models::gateway::OutboundEvent;
use liveclass_models::presence::Identity;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type Outbox = mpsc::Sender<Arc<OutboundEvent>>;
pub type OutboxReceiver = mpsc::Receiver<Arc<OutboundEvent>>;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 512;

/// One live connection.
pub struct Session {
    pub session_id: String,
    /// Set by the first `join-room`; overwritten by later ones.
    pub identity: Option<Identity>,
    pub rooms: BTreeSet<String>,
    /// `None` once the session fell too far behind and was cut off.
    outbox: Option<Outbox>,
}

impl Session {
    fn new(outbox: Outbox) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            identity: None,
            rooms: BTreeSet::new(),
            outbox: Some(outbox),
        }
    }
}

/// All live sessions and their outbound queues.
///
/// Room membership is mirrored here (`Session::rooms`); callers update both
/// sides while holding the room's lock.
///
/// Outbound queues are bounded. A session whose queue fills up loses its
/// sender: the receiver yields what is already queued and then ends, and the
/// transport is expected to close the connection.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    outbox_capacity: usize,
}

impl SessionRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Register a new connection and hand back its id and outbound queue.
    pub fn register(&self) -> (String, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let session = Session::new(tx);
        let session_id = session.session_id.clone();
        self.sessions.insert(session_id.clone(), session);
        (session_id, rx)
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Last write wins. Returns false for an unknown session.
    pub fn set_identity(&self, session_id: &str, identity: Identity) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.identity = Some(identity);
                true
            }
            None => false,
        }
    }

    pub fn identity(&self, session_id: &str) -> Option<Identity> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.identity.clone())
    }

    pub fn rooms(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_room(&self, session_id: &str, room_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.rooms.insert(room_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn remove_room(&self, session_id: &str, room_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.rooms.remove(room_id);
        }
    }

    /// Identities of the given sessions, in the given order. Sessions without
    /// identity or no longer registered are skipped.
    pub fn identities(&self, session_ids: &[String]) -> Vec<(String, Identity)> {
        session_ids
            .iter()
            .filter_map(|sid| {
                self.sessions
                    .get(sid)
                    .and_then(|s| s.identity.clone())
                    .map(|identity| (sid.clone(), identity))
            })
            .collect()
    }

    /// Queue an event for one session without waiting. Closed, cut-off or
    /// unknown sessions are ignored; a full queue cuts the session off.
    pub fn send(&self, session_id: &str, event: Arc<OutboundEvent>) {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(outbox) = session.outbox.as_ref() else {
            return;
        };
        match outbox.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id,
                    capacity = self.outbox_capacity,
                    "outbound queue full, cutting session off"
                );
                session.outbox = None;
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(session_id, "outbox closed, dropping event");
            }
        }
    }

    /// True when the session's queue overflowed and it no longer gets events.
    pub fn is_cut_off(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.outbox.is_none())
    }

    /// Queue an event for every listed session except `except`.
    pub fn send_to_members(
        &self,
        members: &[String],
        except: Option<&str>,
        event: Arc<OutboundEvent>,
    ) {
        for member in members {
            if except.is_some_and(|e| e == member.as_str()) {
                continue;
            }
            self.send(member, Arc::clone(&event));
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}
