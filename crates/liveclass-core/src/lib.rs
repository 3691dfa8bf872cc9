pub mod broadcast;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod presence_manager;
pub mod room;
pub mod session;
pub mod signaling;

use std::sync::Arc;
use std::time::Duration;

use directory::{AvatarCache, UserLookup};
use presence_manager::PresenceManager;
use room::RoomStore;
use session::SessionRegistry;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// How long a room waits after a departure before re-broadcasting its
    /// participant list.
    pub disconnect_grace: Duration,
    /// Rooms empty for longer than this are dropped with all their state.
    pub room_idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub avatar_cache_max_entries: u64,
    /// Events a session may have queued before it is cut off.
    pub outbox_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_millis(1500),
            room_idle_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            avatar_cache_max_entries: 50_000,
            outbox_capacity: session::DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// Ephemeral per-room state, one lock per room.
    pub rooms: Arc<RoomStore>,
    /// Live connections, their identity and outbound queues.
    pub sessions: Arc<SessionRegistry>,
    /// User id -> avatar reference, filled from the lookup service.
    pub avatars: Arc<AvatarCache>,
    /// Debounced presence re-broadcasts after departures.
    pub presence_manager: Arc<PresenceManager>,
}

impl AppState {
    pub fn new(config: AppConfig, lookup: Arc<dyn UserLookup>) -> Self {
        Self {
            rooms: Arc::new(RoomStore::new()),
            sessions: Arc::new(SessionRegistry::new(config.outbox_capacity)),
            avatars: Arc::new(AvatarCache::new(lookup, config.avatar_cache_max_entries)),
            presence_manager: Arc::new(PresenceManager::new(config.disconnect_grace)),
            config,
        }
    }
}

/// Periodically drop rooms that have stayed empty past the idle TTL.
pub fn spawn_room_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_idle_rooms(&state);
        }
    })
}

/// One sweep pass. Returns the evicted room ids.
pub fn sweep_idle_rooms(state: &AppState) -> Vec<String> {
    let evicted = state.rooms.evict_idle(state.config.room_idle_ttl);
    for room_id in &evicted {
        state.presence_manager.cancel(room_id);
    }
    if !evicted.is_empty() {
        tracing::info!(
            evicted = evicted.len(),
            remaining = state.rooms.room_count(),
            "evicted idle rooms"
        );
    }
    evicted
}
