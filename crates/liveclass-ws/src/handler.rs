use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use liveclass_core::gateway;
use liveclass_core::session::OutboxReceiver;
use liveclass_core::AppState;
use liveclass_models::gateway::ClientEvent;
use tokio::time::Duration;

use crate::GatewayConfig;

const PING_INTERVAL: Duration = Duration::from_secs(20);
/// "Try again later": the client fell behind and should reconnect.
const CLOSE_CODE_LAGGED: u16 = 1013;

fn wire_log_in(session_id: &str, payload: &str) {
    tracing::debug!(
        target: "wire",
        transport = "ws",
        direction = "in",
        session_id,
        bytes = payload.len(),
        payload,
        "server_in"
    );
}

fn wire_log_out(session_id: &str, event: &str, payload: &str) {
    tracing::debug!(
        target: "wire",
        transport = "ws",
        direction = "out",
        session_id,
        event,
        bytes = payload.len(),
        "server_out"
    );
}

fn connection_limiter(config: &GatewayConfig) -> Option<DefaultDirectRateLimiter> {
    NonZeroU32::new(config.max_messages_per_minute)
        .map(|per_minute| RateLimiter::direct(Quota::per_minute(per_minute)))
}

pub(crate) async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    config: Arc<GatewayConfig>,
) {
    let (session_id, outbox) = gateway::connect(&state);
    let (sender, mut receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(
        sender,
        outbox,
        state.clone(),
        session_id.clone(),
    ));
    let mut writer_done = false;
    let limiter = connection_limiter(&config);

    let disconnect_reason = loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            ended = &mut writer => {
                writer_done = true;
                break match ended {
                    Ok(reason) => reason,
                    Err(err) => format!("writer task failed: {err}"),
                };
            }
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                wire_log_in(&session_id, text.as_str());
                if limiter.as_ref().is_some_and(|l| l.check().is_err()) {
                    tracing::debug!(session_id = %session_id, "rate limited (silent drop)");
                    continue;
                }
                let event = match ClientEvent::parse(text.as_str()) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(session_id = %session_id, "dropping malformed event: {err}");
                        continue;
                    }
                };
                let name = event.name();
                let room_id = event.room_id().to_string();
                if let Err(err) = gateway::handle_event(&state, &session_id, event).await {
                    tracing::warn!(
                        session_id = %session_id,
                        room_id = %room_id,
                        event = name,
                        "event rejected: {err}"
                    );
                }
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::warn!(
                    session_id = %session_id,
                    bytes = data.len(),
                    "dropping binary frame"
                );
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!(
                        "client close frame (code={}, reason={})",
                        frame.code, frame.reason
                    ),
                    None => "client close frame (no code/reason)".to_string(),
                };
            }
            Some(Err(err)) => break format!("websocket receive error: {err}"),
            None => break "websocket stream ended".to_string(),
            // Pings are answered by axum; pongs need no handling.
            Some(Ok(_)) => {}
        }
    };

    tracing::info!(session_id = %session_id, "connection closed: {disconnect_reason}");
    // Dropping the session closes its outbox, which ends the writer once the
    // remaining events are flushed.
    gateway::disconnect(&state, &session_id).await;
    if !writer_done {
        if let Err(err) = writer.await {
            tracing::debug!(session_id = %session_id, "writer task ended abnormally: {err}");
        }
    }
}

/// Drains the session's outbound queue to the socket in order and keeps the
/// connection alive with periodic pings. Returns why it stopped.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbox: OutboxReceiver,
    state: AppState,
    session_id: String,
) -> String {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let reason = loop {
        tokio::select! {
            event = outbox.recv() => {
                let Some(event) = event else {
                    if state.sessions.is_cut_off(&session_id) {
                        tracing::warn!(
                            session_id = %session_id,
                            "outbound queue overflowed; forcing reconnect"
                        );
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_CODE_LAGGED,
                                reason: "Fell behind; reconnect required".to_string().into(),
                            })))
                            .await;
                        break "outbound queue overflowed".to_string();
                    }
                    break "outbox closed".to_string();
                };
                let payload = event.to_text();
                wire_log_out(&session_id, event.event, &payload);
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    tracing::debug!(session_id = %session_id, "websocket send failed");
                    break "websocket send error".to_string();
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    tracing::debug!(session_id = %session_id, "websocket ping send error");
                    break "websocket ping send error".to_string();
                }
            }
        }
    };
    let _ = sender.close().await;
    reason
}
