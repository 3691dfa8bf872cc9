mod handler;

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use liveclass_core::AppState;

/// Transport-level limits for the WebSocket gateway.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Browser origins allowed to open a connection. `*` allows any.
    pub allowed_origins: Vec<String>,
    /// Inbound events accepted per connection and minute; 0 disables the
    /// limit.
    pub max_messages_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            max_messages_per_minute: 600,
        }
    }
}

impl GatewayConfig {
    /// Requests without an `Origin` header come from non-browser clients and
    /// are let through.
    fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let origin = origin.trim_end_matches('/');
        self.allowed_origins.iter().any(|allowed| {
            allowed == "*" || allowed.trim_end_matches('/').eq_ignore_ascii_case(origin)
        })
    }
}

pub fn gateway_router(config: GatewayConfig) -> Router<AppState> {
    let config = Arc::new(config);
    Router::new().route(
        "/ws",
        get(
            move |ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<AppState>| {
                ws_upgrade(ws, headers, state, Arc::clone(&config))
            },
        ),
    )
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    state: AppState,
    config: Arc<GatewayConfig>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !config.origin_allowed(origin) {
        tracing::warn!(origin = ?origin, "rejected websocket upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_matching() {
        let config = GatewayConfig {
            allowed_origins: vec!["https://class.example.com/".into()],
            max_messages_per_minute: 10,
        };
        assert!(config.origin_allowed(Some("https://class.example.com")));
        assert!(config.origin_allowed(Some("HTTPS://CLASS.EXAMPLE.COM")));
        assert!(!config.origin_allowed(Some("https://evil.example.com")));
        assert!(config.origin_allowed(None));
    }

    #[test]
    fn wildcard_allows_any_origin() {
        let config = GatewayConfig {
            allowed_origins: vec!["*".into()],
            max_messages_per_minute: 10,
        };
        assert!(config.origin_allowed(Some("https://anywhere.test")));
    }
}
