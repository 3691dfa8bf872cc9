use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;

/// Debounces presence re-broadcasts per room.
///
/// A room has at most one pending task. Scheduling again aborts the pending
/// one and restarts the grace period, so a burst of disconnects settles into
/// a single projection computed when the timer fires.
pub struct PresenceManager {
    grace: Duration,
    pending: DashMap<String, (u64, AbortHandle)>,
    next_generation: AtomicU64,
}

impl PresenceManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: DashMap::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run `task` once the grace period has elapsed without another
    /// `schedule` for the same room.
    pub fn schedule<F>(self: &Arc<Self>, room_id: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::clone(self);
        let key = room_id.to_string();
        let grace = self.grace;

        // The entry stays locked until the handle is stored, so the new task
        // cannot clear its own slot before it exists.
        let entry = self.pending.entry(room_id.to_string());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // Only clear our own slot; a newer schedule owns it otherwise.
            manager
                .pending
                .remove_if(&key, |_, (current, _)| *current == generation);
            task.await;
        })
        .abort_handle();

        match entry {
            Entry::Occupied(mut slot) => {
                let (_, previous) = slot.insert((generation, handle));
                previous.abort();
                tracing::debug!(room_id, "presence refresh rescheduled");
            }
            Entry::Vacant(slot) => {
                slot.insert((generation, handle));
            }
        }
    }

    /// Drop the pending task for a room, if any.
    pub fn cancel(&self, room_id: &str) -> bool {
        match self.pending.remove(room_id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
