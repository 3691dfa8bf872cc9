use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use liveclass_core::AppState;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

pub fn build_router(state: AppState, config: &Config) -> Result<Router> {
    Ok(Router::new()
        .route("/health", get(health))
        .merge(liveclass_ws::gateway_router(config.gateway_config()))
        .layer(build_cors_layer(&config.server.allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins = allowed_origins
            .iter()
            .map(|o| {
                HeaderValue::from_str(o.trim_end_matches('/'))
                    .with_context(|| format!("invalid origin '{o}' in server.allowed_origins"))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "liveclass",
            "rooms": state.rooms.room_count(),
            "sessions": state.sessions.session_count(),
        })),
    )
}
