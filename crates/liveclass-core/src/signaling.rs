use liveclass_models::gateway::{OutboundEvent, Signal};
use serde_json::json;

use crate::error::CoreError;
use crate::AppState;

/// Forward an offer, answer or ICE candidate to every other session in the
/// room. The payload is passed through untouched; receivers learn who sent
/// it from `sessionId` and `userId`.
pub async fn relay(
    state: &AppState,
    session_id: &str,
    event: &'static str,
    signal: Signal,
) -> Result<(), CoreError> {
    let room = state.rooms.lock(&signal.room_id).await;
    let outbound = OutboundEvent::new(
        event,
        json!({
            "payload": signal.payload,
            "sessionId": session_id,
            "userId": signal.user_id,
        }),
    );
    tracing::debug!(
        room_id = %signal.room_id,
        session_id,
        event,
        recipients = room.members().len().saturating_sub(1),
        "relaying signal"
    );
    state
        .sessions
        .send_to_members(room.members(), Some(session_id), outbound);
    Ok(())
}
